//! Atomic read-modify-write operations run against a single key.
//!
//! Every lease transition happens inside one of these scripts. Stores with a
//! server-side Lua engine (Redis) run [`Script::source`]; stores without one run
//! [`emulate`] while holding their own write lock. Both must agree exactly.
//!
//! Replies are flat string tables whose first element is a status word.
//! Whenever a stored value cannot be parsed as an entry the reply is
//! `["corrupt", raw]` and nothing is written.

use crate::entry::Entry;
use crate::error::CacheError;

/// Status words used in script replies.
pub mod status {
    pub const HIT: &str = "hit";
    pub const LOCKED: &str = "locked";
    pub const ACQUIRED: &str = "acquired";
    pub const CORRUPT: &str = "corrupt";
    pub const WRITTEN: &str = "written";
    pub const DELETED: &str = "deleted";
    pub const DISCARDED: &str = "discarded";
    pub const UNLOCKED: &str = "unlocked";
    pub const TAGGED: &str = "tagged";
    pub const ABSENT: &str = "absent";
}

/// Lease acquisition mode passed to [`Script::AcquireOrRead`].
pub mod mode {
    /// Return clean entries as hits, otherwise try to take the lease.
    pub const READ: &str = "read";
    /// Always try to take the lease; re-entrant for the same owner.
    pub const UPDATE: &str = "update";
    /// Release: write the payload.
    pub const SET: &str = "set";
    /// Release: remove the key.
    pub const DELETE: &str = "delete";
}

/// An atomic operation on one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Script {
    /// `ARGV = [now_ms, lock_until_ms, owner, lock_ms, mode]`
    ///
    /// Replies `hit`, `locked` or `acquired`, followed by the previous raw value
    /// (`""` when the key was absent).
    AcquireOrRead,
    /// `ARGV = [owner, version, set|delete, payload, expire_ms]`
    ///
    /// Writes only while `owner` still holds the lease and the version has not
    /// moved. Replies `written`, `deleted` or `discarded`.
    Release,
    /// `ARGV = [owner, ttl_ms]`
    ///
    /// Drops `owner`'s lease and leaves the entry marked for refresh with its
    /// payload untouched. `ttl_ms = 0` keeps the current TTL. Replies `unlocked`
    /// or `discarded`.
    Unlock,
    /// `ARGV = [delay_ms]`
    ///
    /// Bumps the version, clears any lease and marks the entry for refresh.
    /// Replies `tagged, <version>` or `absent`.
    TagAsDeleted,
}

// Accepts exactly what `Entry::decode` accepts: only the four known fields,
// string `v`/`lo`, integer `lu`, non-negative integer `ver`. `null` optionals
// read as absent.
const DECODE_PRELUDE: &str = r#"
local fields = {v = 'string', lu = 'number', lo = 'string', ver = 'number'}
local function is_entry(d)
  if type(d) ~= 'table' then
    return false
  end
  for k, val in pairs(d) do
    local want = fields[k]
    if want == nil then
      return false
    end
    if val == cjson.null and k ~= 'ver' then
      d[k] = nil
    elseif type(val) ~= want then
      return false
    elseif want == 'number' and val ~= math.floor(val) then
      return false
    end
  end
  return type(d.ver) == 'number' and d.ver >= 0
end
local raw = redis.call('GET', KEYS[1])
local e = nil
if raw then
  local ok, decoded = pcall(cjson.decode, raw)
  if not ok or not is_entry(decoded) then
    return {'corrupt', raw}
  end
  e = decoded
end
"#;

const ACQUIRE_OR_READ: &str = r#"
local now = tonumber(ARGV[1])
local lock_until = tonumber(ARGV[2])
local owner = ARGV[3]
local lock_ms = tonumber(ARGV[4])
if e == nil then
  redis.call('SET', KEYS[1], cjson.encode({lu = lock_until, lo = owner, ver = 0}), 'PX', lock_ms)
  return {'acquired', ''}
end
if ARGV[5] == 'read' and e.lu == nil and e.v ~= nil then
  return {'hit', raw}
end
if e.lo ~= nil and e.lo ~= owner and e.lu ~= nil and tonumber(e.lu) > now then
  return {'locked', raw}
end
e.lu = lock_until
e.lo = owner
local ttl = redis.call('PTTL', KEYS[1])
if ttl < lock_ms then
  ttl = lock_ms
end
redis.call('SET', KEYS[1], cjson.encode(e), 'PX', ttl)
return {'acquired', raw}
"#;

const RELEASE: &str = r#"
if e == nil or e.lo ~= ARGV[1] or e.ver ~= tonumber(ARGV[2]) then
  return {'discarded'}
end
if ARGV[3] == 'delete' then
  redis.call('DEL', KEYS[1])
  return {'deleted'}
end
redis.call('SET', KEYS[1], cjson.encode({v = ARGV[4], ver = e.ver}), 'PX', ARGV[5])
return {'written'}
"#;

const UNLOCK: &str = r#"
if e == nil or e.lo ~= ARGV[1] then
  return {'discarded'}
end
e.lo = nil
e.lu = 0
local ttl = tonumber(ARGV[2])
if ttl <= 0 then
  ttl = redis.call('PTTL', KEYS[1])
end
if ttl > 0 then
  redis.call('SET', KEYS[1], cjson.encode(e), 'PX', ttl)
else
  redis.call('SET', KEYS[1], cjson.encode(e))
end
return {'unlocked'}
"#;

const TAG_AS_DELETED: &str = r#"
if e == nil then
  return {'absent'}
end
e.ver = e.ver + 1
e.lo = nil
e.lu = 0
redis.call('SET', KEYS[1], cjson.encode(e), 'PX', ARGV[1])
return {'tagged', tostring(e.ver)}
"#;

impl Script {
    /// All scripts, for stores that preload them.
    pub const ALL: [Script; 4] = [
        Script::AcquireOrRead,
        Script::Release,
        Script::Unlock,
        Script::TagAsDeleted,
    ];

    /// A name for metrics/tracing.
    pub fn name(&self) -> &'static str {
        match self {
            Script::AcquireOrRead => "acquire_or_read",
            Script::Release => "release",
            Script::Unlock => "unlock",
            Script::TagAsDeleted => "tag_as_deleted",
        }
    }

    /// Full Lua source, operating on `KEYS[1]`.
    pub fn source(&self) -> String {
        let body = match self {
            Script::AcquireOrRead => ACQUIRE_OR_READ,
            Script::Release => RELEASE,
            Script::Unlock => UNLOCK,
            Script::TagAsDeleted => TAG_AS_DELETED,
        };
        format!("{DECODE_PRELUDE}{body}")
    }
}

/// What a store must do to the key after a script ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Leave the key untouched.
    Keep,
    /// Overwrite the value. `ttl_ms = None` stores it without expiry.
    Put { value: String, ttl_ms: Option<i64> },
    /// Remove the key.
    Delete,
}

/// Result of [`emulate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptOutcome {
    pub mutation: Mutation,
    pub reply: Vec<String>,
}

impl ScriptOutcome {
    fn keep(reply: &[&str]) -> Self {
        ScriptOutcome {
            mutation: Mutation::Keep,
            reply: reply.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn put(entry: &Entry, ttl_ms: Option<i64>, reply: Vec<String>) -> Result<Self, CacheError> {
        Ok(ScriptOutcome {
            mutation: Mutation::Put {
                value: entry.encode()?,
                ttl_ms,
            },
            reply,
        })
    }
}

/// The key's current state as seen by a store: raw value and remaining TTL.
///
/// `ttl_ms = None` means the key has no expiry.
#[derive(Debug, Clone, Copy)]
pub struct Current<'a> {
    pub raw: &'a str,
    pub ttl_ms: Option<i64>,
}

/// Reference implementation of every [`Script`], for stores without a Lua engine.
///
/// The caller must hold exclusive access to the key for the duration of the call
/// and apply the returned mutation before releasing it.
pub fn emulate(
    script: Script,
    current: Option<Current<'_>>,
    args: &[String],
) -> Result<ScriptOutcome, CacheError> {
    let entry = match current {
        Some(cur) => match Entry::decode("", cur.raw) {
            Ok(entry) => Some(entry),
            Err(_) => return Ok(ScriptOutcome::keep(&[status::CORRUPT, cur.raw])),
        },
        None => None,
    };
    // PTTL semantics: -1 for a key without expiry
    let pttl = current.map(|c| c.ttl_ms.unwrap_or(-1)).unwrap_or(-2);

    match script {
        Script::AcquireOrRead => {
            let now = int_arg(script, args, 0)?;
            let lock_until = int_arg(script, args, 1)?;
            let owner = str_arg(script, args, 2)?;
            let lock_ms = int_arg(script, args, 3)?;
            let read = str_arg(script, args, 4)? == mode::READ;

            let Some(mut entry) = entry else {
                let placeholder = Entry::placeholder(owner, lock_until);
                return ScriptOutcome::put(
                    &placeholder,
                    Some(lock_ms),
                    vec![status::ACQUIRED.into(), String::new()],
                );
            };
            let raw = current.map(|c| c.raw).unwrap_or_default();

            if read && entry.is_hit() {
                return Ok(ScriptOutcome::keep(&[status::HIT, raw]));
            }
            if entry.is_locked_by_other(owner, now) {
                return Ok(ScriptOutcome::keep(&[status::LOCKED, raw]));
            }

            entry.lock_until = Some(lock_until);
            entry.lock_owner = Some(owner.to_string());
            ScriptOutcome::put(
                &entry,
                Some(pttl.max(lock_ms)),
                vec![status::ACQUIRED.into(), raw.to_string()],
            )
        }
        Script::Release => {
            let owner = str_arg(script, args, 0)?;
            let version = int_arg(script, args, 1)?;
            let delete = str_arg(script, args, 2)? == mode::DELETE;
            let payload = str_arg(script, args, 3)?;
            let expire_ms = int_arg(script, args, 4)?;

            let Some(entry) = entry.filter(|e| e.is_owned_by(owner) && e.version as i64 == version)
            else {
                return Ok(ScriptOutcome::keep(&[status::DISCARDED]));
            };
            if delete {
                return Ok(ScriptOutcome {
                    mutation: Mutation::Delete,
                    reply: vec![status::DELETED.into()],
                });
            }
            ScriptOutcome::put(
                &Entry::new(payload, entry.version),
                Some(expire_ms),
                vec![status::WRITTEN.into()],
            )
        }
        Script::Unlock => {
            let owner = str_arg(script, args, 0)?;
            let ttl_ms = int_arg(script, args, 1)?;

            let Some(mut entry) = entry.filter(|e| e.is_owned_by(owner)) else {
                return Ok(ScriptOutcome::keep(&[status::DISCARDED]));
            };
            entry.lock_owner = None;
            entry.lock_until = Some(0);
            let ttl = if ttl_ms > 0 { ttl_ms } else { pttl };
            ScriptOutcome::put(
                &entry,
                (ttl > 0).then_some(ttl),
                vec![status::UNLOCKED.into()],
            )
        }
        Script::TagAsDeleted => {
            let delay_ms = int_arg(script, args, 0)?;

            let Some(mut entry) = entry else {
                return Ok(ScriptOutcome::keep(&[status::ABSENT]));
            };
            entry.version += 1;
            entry.lock_owner = None;
            entry.lock_until = Some(0);
            let version = entry.version.to_string();
            ScriptOutcome::put(
                &entry,
                Some(delay_ms),
                vec![status::TAGGED.into(), version],
            )
        }
    }
}

fn str_arg<'a>(script: Script, args: &'a [String], idx: usize) -> Result<&'a str, CacheError> {
    args.get(idx).map(String::as_str).ok_or_else(|| {
        CacheError::operation(
            "script",
            "",
            format!("{} expects argument {}", script.name(), idx + 1),
        )
    })
}

fn int_arg(script: Script, args: &[String], idx: usize) -> Result<i64, CacheError> {
    let raw = str_arg(script, args, idx)?;
    raw.parse().map_err(|_| {
        CacheError::operation(
            "script",
            "",
            format!("{} argument {} is not an integer: {}", script.name(), idx + 1, raw),
        )
    })
}
