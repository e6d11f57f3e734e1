/// Lua script for fixed window counting in Redis
///
/// Increments the counter and starts the window on the first hit, so the
/// whole bucket expires at once when the window elapses.
///
/// KEYS[1] = the counter key
/// ARGV[1] = window duration (milliseconds)
///
/// Returns: [current count, milliseconds until reset]
pub const FIXED_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local window = tonumber(ARGV[1])

-- Increment counter
local current = redis.call('INCR', key)

-- Set expiry on first request
if current == 1 then
    redis.call('PEXPIRE', key, window)
end

-- Get TTL for reset time
local ttl = redis.call('PTTL', key)
if ttl < 0 then
    -- No expiry set, set it now
    redis.call('PEXPIRE', key, window)
    ttl = window
end

return {current, ttl}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_window_script_shape() {
        assert!(FIXED_WINDOW_SCRIPT.contains("INCR"));
        assert!(FIXED_WINDOW_SCRIPT.contains("PEXPIRE"));
        assert!(FIXED_WINDOW_SCRIPT.contains("PTTL"));
    }
}
