//! The atomic server-side scripts backing every multi-field ledger update.
//!
//! Each script is submitted with the data key and stream key as `KEYS[1]`/`KEYS[2]` and the
//! volume name (and, where relevant, capacity or fencing token) as `ARGV`, in a fixed argument
//! order each caller matches exactly. `redis::Script` gets Redis's `EVALSHA` caching for free once
//! invoked, so building a fresh `Script` per call costs nothing beyond owning the source string.

use redis::Script;

/// iff `approved_capacity` still equals the fencing token passed in `ARGV[2]`: set `approved`,
/// set `capacity`, increment `approved_capacity`, append a `status:"approved"` stream entry.
/// Returns `1` on success, `0` if the volume was already approved (idempotent short-circuit
/// inside the atomic section, guarding the race between the caller's own idempotency check and
/// the script running), `-1` if the fencing token is stale (caller retries).
pub fn approve() -> Script {
    Script::new(
        r#"
        local data_key = KEYS[1]
        local stream_key = KEYS[2]
        local name = ARGV[1]
        local capacity = ARGV[2]
        local fence = ARGV[3]

        local approved_field = "vol:" .. name .. ":approved"
        local capacity_field = "vol:" .. name .. ":capacity"

        if redis.call("HEXISTS", data_key, approved_field) == 1 then
            return 0
        end

        local current = redis.call("HGET", data_key, "approved_capacity")
        if current == false then
            current = "0"
        end
        if current ~= fence then
            return -1
        end

        redis.call("HSET", data_key, approved_field, "1")
        redis.call("HSET", data_key, capacity_field, capacity)
        redis.call("HINCRBY", data_key, "approved_capacity", capacity)
        redis.call("XADD", stream_key, "*", "name", name, "cap", capacity, "status", "approved")
        return 1
        "#,
    )
}

/// iff `approved` is set: set `deleting`, append a `status:"deleting"` stream entry. Returns `1`
/// on success, `0` if `approved` was never set.
pub fn delete_request() -> Script {
    Script::new(
        r#"
        local data_key = KEYS[1]
        local stream_key = KEYS[2]
        local name = ARGV[1]

        local approved_field = "vol:" .. name .. ":approved"
        local deleting_field = "vol:" .. name .. ":deleting"

        if redis.call("HEXISTS", data_key, approved_field) == 0 then
            return 0
        end

        redis.call("HSET", data_key, deleting_field, "1")
        redis.call("XADD", stream_key, "*", "name", name, "status", "deleting")
        return 1
        "#,
    )
}

/// iff `approved` is set: set `created`, append a `status:"created"` stream entry carrying the
/// volume's recorded capacity. Returns `1` on success, `0` if `approved` was never set.
pub fn publish_created() -> Script {
    Script::new(
        r#"
        local data_key = KEYS[1]
        local stream_key = KEYS[2]
        local name = ARGV[1]

        local approved_field = "vol:" .. name .. ":approved"
        local created_field = "vol:" .. name .. ":created"
        local capacity_field = "vol:" .. name .. ":capacity"

        if redis.call("HEXISTS", data_key, approved_field) == 0 then
            return 0
        end

        redis.call("HSET", data_key, created_field, "1")
        local cap = redis.call("HGET", data_key, capacity_field)
        if cap == false then
            cap = "0"
        end
        redis.call("XADD", stream_key, "*", "name", name, "cap", cap, "status", "created")
        return 1
        "#,
    )
}

/// iff `approved` is set: set `deleted`, defensively `HSETNX` capacity to 0, return capacity to
/// the quota via a negative `HINCRBY` when it was positive, and append a `status:"deleted"`
/// stream entry. Returns `1` on success, `0` if `approved` was never set, `2` if `deleted` was
/// already set (idempotent short-circuit -- the capacity was already returned by an earlier call
/// and must not be decremented again).
pub fn publish_deleted() -> Script {
    Script::new(
        r#"
        local data_key = KEYS[1]
        local stream_key = KEYS[2]
        local name = ARGV[1]

        local approved_field = "vol:" .. name .. ":approved"
        local deleted_field = "vol:" .. name .. ":deleted"
        local capacity_field = "vol:" .. name .. ":capacity"

        if redis.call("HEXISTS", data_key, approved_field) == 0 then
            return 0
        end
        if redis.call("HEXISTS", data_key, deleted_field) == 1 then
            return 2
        end

        redis.call("HSET", data_key, deleted_field, "1")
        redis.call("HSETNX", data_key, capacity_field, "0")
        local cap = tonumber(redis.call("HGET", data_key, capacity_field))
        if cap > 0 then
            redis.call("HINCRBY", data_key, "approved_capacity", -cap)
        end
        redis.call("XADD", stream_key, "*", "name", name, "cap", tostring(cap), "status", "deleted")
        return 1
        "#,
    )
}
