//! Store operations.
//!
//! [`Commands`] is the explicit set of operations a handle exposes. Both
//! [`Client`](crate::Client) and [`DefaultRouter`](crate::DefaultRouter)
//! implement it; everything else is reachable through the raw command path
//! as long as the command is in [`SUPPORTED_COMMANDS`].

use async_trait::async_trait;

use crate::error::ClientError;
use crate::resp::{Command, FromValue, ToArg, Value};

/// Commands a handle will forward, uppercase.
pub const SUPPORTED_COMMANDS: &[&str] = &[
    // connection
    "PING", "ECHO", "QUIT", "SELECT", "AUTH", "CLIENT",
    // keys
    "DEL", "EXISTS", "EXPIRE", "PEXPIRE", "TTL", "PTTL", "PERSIST", "TYPE", "KEYS", "SCAN",
    "RENAME", "UNLINK",
    // strings
    "GET", "SET", "SETNX", "SETEX", "GETSET", "GETDEL", "MGET", "MSET", "APPEND", "STRLEN",
    "INCR", "INCRBY", "DECR", "DECRBY",
    // hashes
    "HGET", "HSET", "HDEL", "HEXISTS", "HGETALL", "HKEYS", "HVALS", "HLEN", "HINCRBY",
    // lists
    "LPUSH", "RPUSH", "LPOP", "RPOP", "LRANGE", "LLEN",
    // sets
    "SADD", "SREM", "SMEMBERS", "SISMEMBER", "SCARD",
    // pubsub
    "PUBLISH",
    // server
    "DBSIZE", "FLUSHDB", "INFO", "TIME",
];

/// Whether `name` (any case) is a supported command.
pub fn is_supported(name: &str) -> bool {
    SUPPORTED_COMMANDS
        .iter()
        .any(|cmd| cmd.eq_ignore_ascii_case(name))
}

/// Typed store operations.
///
/// Implementors provide [`Commands::send_command`]; every other method builds
/// a command and converts the reply.
#[async_trait]
pub trait Commands: Send + Sync {
    type Error: From<ClientError> + Send;

    async fn send_command(&self, cmd: Command) -> Result<Value, Self::Error>;

    async fn query<T: FromValue + Send>(&self, cmd: Command) -> Result<T, Self::Error> {
        let value = self.send_command(cmd).await?;
        Ok(T::from_value(value)?)
    }

    async fn ping(&self) -> Result<String, Self::Error> {
        self.query(Command::new("PING")).await
    }

    async fn echo(&self, message: &str) -> Result<String, Self::Error> {
        self.query(Command::new("ECHO").arg(message)).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, Self::Error> {
        self.query(Command::new("GET").arg(key)).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), Self::Error> {
        self.query(Command::new("SET").arg(key).arg(value)).await
    }

    /// `SET key value EX seconds`.
    async fn set_ex(&self, key: &str, value: &str, seconds: u64) -> Result<(), Self::Error> {
        self.query(Command::new("SET").arg(key).arg(value).arg("EX").arg(seconds))
            .await
    }

    /// `SET key value NX`; `true` if the key was set.
    async fn set_nx(&self, key: &str, value: &str) -> Result<bool, Self::Error> {
        self.query(Command::new("SET").arg(key).arg(value).arg("NX"))
            .await
    }

    async fn del(&self, keys: &[&str]) -> Result<i64, Self::Error> {
        self.query(Command::new("DEL").args(keys.iter().copied()))
            .await
    }

    async fn exists(&self, key: &str) -> Result<bool, Self::Error> {
        self.query(Command::new("EXISTS").arg(key)).await
    }

    async fn expire(&self, key: &str, seconds: u64) -> Result<bool, Self::Error> {
        self.query(Command::new("EXPIRE").arg(key).arg(seconds)).await
    }

    async fn ttl(&self, key: &str) -> Result<i64, Self::Error> {
        self.query(Command::new("TTL").arg(key)).await
    }

    async fn incr(&self, key: &str) -> Result<i64, Self::Error> {
        self.query(Command::new("INCR").arg(key)).await
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, Self::Error> {
        self.query(Command::new("INCRBY").arg(key).arg(delta)).await
    }

    async fn decr(&self, key: &str) -> Result<i64, Self::Error> {
        self.query(Command::new("DECR").arg(key)).await
    }

    async fn mget(&self, keys: &[&str]) -> Result<Vec<Option<String>>, Self::Error> {
        self.query(Command::new("MGET").args(keys.iter().copied()))
            .await
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, Self::Error> {
        self.query(Command::new("HGET").arg(key).arg(field)).await
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<i64, Self::Error> {
        self.query(Command::new("HSET").arg(key).arg(field).arg(value))
            .await
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<i64, Self::Error> {
        self.query(Command::new("HDEL").arg(key).arg(field)).await
    }

    /// Field/value pairs of a hash, in reply order.
    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>, Self::Error> {
        let flat: Vec<String> = self.query(Command::new("HGETALL").arg(key)).await?;
        let mut pairs = Vec::with_capacity(flat.len() / 2);
        let mut iter = flat.into_iter();
        while let (Some(field), Some(value)) = (iter.next(), iter.next()) {
            pairs.push((field, value));
        }
        Ok(pairs)
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<i64, Self::Error> {
        self.query(Command::new("LPUSH").arg(key).arg(value)).await
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<i64, Self::Error> {
        self.query(Command::new("RPUSH").arg(key).arg(value)).await
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, Self::Error> {
        self.query(Command::new("LRANGE").arg(key).arg(start).arg(stop))
            .await
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<i64, Self::Error> {
        self.query(Command::new("SADD").arg(key).arg(member)).await
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, Self::Error> {
        self.query(Command::new("SMEMBERS").arg(key)).await
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<i64, Self::Error> {
        self.query(Command::new("PUBLISH").arg(channel).arg(message))
            .await
    }

    async fn dbsize(&self) -> Result<i64, Self::Error> {
        self.query(Command::new("DBSIZE")).await
    }
}

/// Build a command from an operation name and string arguments.
pub fn command_from_parts<A: ToArg>(operation: &str, args: impl IntoIterator<Item = A>) -> Command {
    Command::new(operation).args(args)
}
