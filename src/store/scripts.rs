use std::time::Duration;

use super::ScriptReply;
use crate::error::StoreError;

/// 脚本内可用的存储操作，供不支持 Lua 的后端原子执行脚本
pub trait ScriptOps {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&mut self, key: &str, value: String, ttl: Option<Duration>);
    fn delete(&mut self, key: &str) -> bool;
}

pub type NativeScript =
    fn(&mut dyn ScriptOps, &[String], &[String]) -> Result<ScriptReply, StoreError>;

/// 原子脚本：Redis 执行 `lua`，内存后端在持锁状态下执行 `native`，两者语义一致
#[derive(Debug)]
pub struct StoreScript {
    pub name: &'static str,
    pub lua: &'static str,
    pub native: NativeScript,
}

/// KEYS[1]; ARGV = [expected_present(1/0), expected, new, ttl_ms(0 = 不过期)]
pub static COMPARE_AND_SET: StoreScript = StoreScript {
    name: "compare_and_set",
    lua: r#"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '1' then
  if current ~= ARGV[2] then return 0 end
elseif current then
  return 0
end
local ttl = tonumber(ARGV[4])
if ttl > 0 then
  redis.call('SET', KEYS[1], ARGV[3], 'PX', ttl)
else
  redis.call('SET', KEYS[1], ARGV[3])
end
return 1
"#,
    native: compare_and_set_native,
};

/// KEYS[1]; ARGV = [expected]
pub static COMPARE_AND_DELETE: StoreScript = StoreScript {
    name: "compare_and_delete",
    lua: r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#,
    native: compare_and_delete_native,
};

pub(crate) fn compare_and_set_args(
    expected: Option<&str>,
    new: &str,
    ttl: Option<Duration>,
) -> Vec<String> {
    let ttl_ms = ttl.map(|t| t.as_millis().max(1)).unwrap_or(0);
    vec![
        if expected.is_some() { "1" } else { "0" }.to_string(),
        expected.unwrap_or_default().to_string(),
        new.to_string(),
        ttl_ms.to_string(),
    ]
}

fn arg<'a>(script: &str, args: &'a [String], index: usize) -> Result<&'a str, StoreError> {
    args.get(index)
        .map(String::as_str)
        .ok_or_else(|| StoreError::inconsistent(script, format!("missing argument {index}")))
}

fn compare_and_set_native(
    ops: &mut dyn ScriptOps,
    keys: &[String],
    args: &[String],
) -> Result<ScriptReply, StoreError> {
    let name = COMPARE_AND_SET.name;
    let key = arg(name, keys, 0)?;
    let expect_present = arg(name, args, 0)? == "1";
    let expected = arg(name, args, 1)?;
    let new = arg(name, args, 2)?;
    let ttl_ms: u64 = arg(name, args, 3)?
        .parse()
        .map_err(|e| StoreError::inconsistent(name, e))?;

    let current = ops.get(key);
    let matches = match (&current, expect_present) {
        (Some(value), true) => value == expected,
        (None, false) => true,
        _ => false,
    };
    if !matches {
        return Ok(ScriptReply::Int(0));
    }

    let ttl = (ttl_ms > 0).then(|| Duration::from_millis(ttl_ms));
    ops.set(key, new.to_string(), ttl);
    Ok(ScriptReply::Int(1))
}

fn compare_and_delete_native(
    ops: &mut dyn ScriptOps,
    keys: &[String],
    args: &[String],
) -> Result<ScriptReply, StoreError> {
    let name = COMPARE_AND_DELETE.name;
    let key = arg(name, keys, 0)?;
    let expected = arg(name, args, 0)?;

    if ops.get(key).as_deref() == Some(expected) {
        Ok(ScriptReply::Int(ops.delete(key) as i64))
    } else {
        Ok(ScriptReply::Int(0))
    }
}
