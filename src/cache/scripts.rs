//! Server-side Lua scripts for the Redis-backed store.
//!
//! Each script is one indivisible read-modify-write. `InMemoryCacheStore`
//! implements the same semantics under its write lock.

use redis::Script;

/// KEYS[1] = member set, KEYS[2] = counter, ARGV[1] = member.
/// Returns `{changed, count}`.
const LIKE_SCRIPT: &str = r"
local set_key = KEYS[1]
local counter_key = KEYS[2]
local member = ARGV[1]

if redis.call('SADD', set_key, member) == 1 then
    local count = redis.call('INCR', counter_key)
    return {1, count}
end

local current = redis.call('GET', counter_key)
return {0, tonumber(current) or 0}
";

/// Same keys as the like script. The counter is clamped at zero.
const UNLIKE_SCRIPT: &str = r"
local set_key = KEYS[1]
local counter_key = KEYS[2]
local member = ARGV[1]

if redis.call('SREM', set_key, member) == 1 then
    local count = redis.call('DECR', counter_key)
    if count < 0 then
        redis.call('SET', counter_key, 0)
        count = 0
    end
    return {1, count}
end

local current = redis.call('GET', counter_key)
return {0, tonumber(current) or 0}
";

/// KEYS[1] = member set, KEYS[2] = counter, ARGV = members.
/// Returns 1 when seeded, 0 when the like state was already whole.
const SEED_SCRIPT: &str = r"
local set_key = KEYS[1]
local counter_key = KEYS[2]

local count = redis.call('GET', counter_key)
if count and (tonumber(count) == 0 or redis.call('EXISTS', set_key) == 1) then
    return 0
end

redis.call('DEL', set_key)
for i = 1, #ARGV do
    redis.call('SADD', set_key, ARGV[i])
end
redis.call('SET', counter_key, redis.call('SCARD', set_key))
return 1
";

/// KEYS[1] = ranking, ARGV[1] = member, ARGV[2] = score, ARGV[3] = sentinel.
/// Returns 1 when inserted, 0 when the ranking is cold.
const RANKING_ADD_IF_PRESENT_SCRIPT: &str = r"
local key = KEYS[1]

if redis.call('EXISTS', key) == 0 then
    return 0
end

redis.call('ZREM', key, ARGV[3])
redis.call('ZADD', key, ARGV[2], ARGV[1])
redis.call('PERSIST', key)
return 1
";

/// KEYS[1] = ranking, ARGV[1] = sentinel.
/// Returns -1 when cold, 0 when only the sentinel is present, else the size.
const RANKING_STATE_SCRIPT: &str = r"
local key = KEYS[1]
local n = redis.call('ZCARD', key)

if n == 0 then
    return -1
end
if n == 1 and redis.call('ZSCORE', key, ARGV[1]) then
    return 0
end
return n
";

/// KEYS[1] = hash, ARGV[1] = field, ARGV[2] = delta, ARGV[3] = absent marker.
/// Returns the new value, or nil when the hash is missing or a placeholder.
const HINCR_IF_PRESENT_SCRIPT: &str = r"
local key = KEYS[1]

if redis.call('EXISTS', key) == 0 then
    return false
end
if redis.call('HEXISTS', key, ARGV[3]) == 1 then
    return false
end
return redis.call('HINCRBY', key, ARGV[1], ARGV[2])
";

/// Scripts with their SHA1 precomputed once per client.
pub(crate) struct Scripts {
  pub like: Script,
  pub unlike: Script,
  pub seed: Script,
  pub ranking_add_if_present: Script,
  pub ranking_state: Script,
  pub hincr_if_present: Script,
}

impl Scripts {
  pub fn load() -> Self {
    Self {
      like: Script::new(LIKE_SCRIPT),
      unlike: Script::new(UNLIKE_SCRIPT),
      seed: Script::new(SEED_SCRIPT),
      ranking_add_if_present: Script::new(RANKING_ADD_IF_PRESENT_SCRIPT),
      ranking_state: Script::new(RANKING_STATE_SCRIPT),
      hincr_if_present: Script::new(HINCR_IF_PRESENT_SCRIPT),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_scripts_have_distinct_hashes() {
    let scripts = Scripts::load();
    let hashes = [
      scripts.like.get_hash(),
      scripts.unlike.get_hash(),
      scripts.seed.get_hash(),
      scripts.ranking_add_if_present.get_hash(),
      scripts.ranking_state.get_hash(),
      scripts.hincr_if_present.get_hash(),
    ];
    let unique: std::collections::HashSet<_> = hashes.iter().collect();
    assert_eq!(unique.len(), hashes.len());
  }
}
