/// Lua script appending one outcome to a circuit's sorted set
///
/// The sequence is drawn from a shared counter and zero-padded into the member
/// so members sharing a score sort in append order.
///
/// KEYS[1] = the outcome series key (failures or successes)
/// KEYS[2] = the sequence counter key
/// ARGV[1] = timestamp score (epoch microseconds)
/// ARGV[2] = JSON payload
///
/// Returns: the assigned sequence number
pub const WRITE_SCRIPT: &str = r#"
local series = KEYS[1]
local counter = KEYS[2]
local score = ARGV[1]
local payload = ARGV[2]

local seq = redis.call('INCR', counter)
local member = string.format('%020d', seq) .. ':' .. payload
redis.call('ZADD', series, score, member)

return seq
"#;

/// Lua script pruning a circuit's window, appending one outcome and capping
/// its failures, all in one step
///
/// KEYS[1] = the failure series key
/// KEYS[2] = the success series key
/// KEYS[3] = the sequence counter key
/// ARGV[1] = window start (epoch microseconds, inclusive)
/// ARGV[2] = timestamp score (epoch microseconds)
/// ARGV[3] = JSON payload
/// ARGV[4] = "1" for a failure, "0" for a success
/// ARGV[5] = number of failures to keep, 0 for no cap
///
/// Returns: the assigned sequence number
pub const RECORD_SCRIPT: &str = r#"
local failures = KEYS[1]
local successes = KEYS[2]
local counter = KEYS[3]
local window_start = ARGV[1]
local score = ARGV[2]
local payload = ARGV[3]
local is_failure = ARGV[4] == '1'
local keep = tonumber(ARGV[5])

redis.call('ZREMRANGEBYSCORE', failures, '-inf', '(' .. window_start)
redis.call('ZREMRANGEBYSCORE', successes, '-inf', '(' .. window_start)

local seq = redis.call('INCR', counter)
local member = string.format('%020d', seq) .. ':' .. payload
if is_failure then
    redis.call('ZADD', failures, score, member)
    if keep > 0 then
        redis.call('ZREMRANGEBYRANK', failures, 0, -keep - 1)
    end
else
    redis.call('ZADD', successes, score, member)
end

return seq
"#;

/// Lua script pruning both series of a circuit and reading what is left
///
/// KEYS[1] = the failure series key
/// KEYS[2] = the success series key
/// ARGV[1] = window start (epoch microseconds, inclusive)
/// ARGV[2] = now (epoch microseconds, inclusive)
///
/// Returns: [failure members, success members]
pub const PRUNE_AND_RANGE_SCRIPT: &str = r#"
local failures = KEYS[1]
local successes = KEYS[2]
local window_start = ARGV[1]
local now = ARGV[2]

-- Remove entries strictly older than the window
redis.call('ZREMRANGEBYSCORE', failures, '-inf', '(' .. window_start)
redis.call('ZREMRANGEBYSCORE', successes, '-inf', '(' .. window_start)

local failed = redis.call('ZRANGEBYSCORE', failures, window_start, now)
local succeeded = redis.call('ZRANGEBYSCORE', successes, window_start, now)

return {failed, succeeded}
"#;

/// Lua script releasing a lease only if the caller still holds it
///
/// KEYS[1] = the lock key
/// ARGV[1] = the holder token
///
/// Returns: 1 if released, 0 otherwise
pub const RELEASE_LOCK_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripts_are_valid() {
        assert!(WRITE_SCRIPT.contains("INCR"));
        assert!(WRITE_SCRIPT.contains("ZADD"));
        assert!(WRITE_SCRIPT.contains("%020d"));

        assert!(RECORD_SCRIPT.contains("'(' .. window_start"));
        assert!(RECORD_SCRIPT.contains("ZREMRANGEBYRANK"));
        assert!(RECORD_SCRIPT.contains("%020d"));

        assert!(PRUNE_AND_RANGE_SCRIPT.contains("ZREMRANGEBYSCORE"));
        assert!(PRUNE_AND_RANGE_SCRIPT.contains("'(' .. window_start"));
        assert!(PRUNE_AND_RANGE_SCRIPT.contains("ZRANGEBYSCORE"));

        assert!(RELEASE_LOCK_SCRIPT.contains("GET"));
        assert!(RELEASE_LOCK_SCRIPT.contains("DEL"));
    }
}
