//! RESP2 wire format.
//!
//! Client-side framing for the Redis serialization protocol:
//! - Simple Strings (+)
//! - Errors (-)
//! - Integers (:)
//! - Bulk Strings ($, `$-1` is nil)
//! - Arrays (*, `*-1` is nil)
//!
//! Requests are always encoded as arrays of bulk strings.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ClientError;

/// Maximum nesting depth for arrays.
pub const MAX_NESTING_DEPTH: usize = 32;

/// Maximum bulk string size (512MB).
pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// Maximum array elements.
pub const MAX_ELEMENTS: usize = 1_000_000;

/// A reply value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Nil,
    Int(i64),
    Data(Bytes),
    Status(String),
    Error(String),
    Array(Vec<Value>),
}

impl Value {
    /// `+OK` reply.
    pub fn is_ok(&self) -> bool {
        matches!(self, Value::Status(s) if s == "OK")
    }
}

/// A request: command name followed by its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    name: String,
    args: Vec<Bytes>,
}

impl Command {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into().to_ascii_uppercase(),
            args: Vec::new(),
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl ToArg) -> Self {
        self.args.push(arg.to_arg());
        self
    }

    /// Append every item of `args`.
    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: ToArg,
    {
        self.args.extend(args.into_iter().map(|a| a.to_arg()));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    pub fn arguments(&self) -> &[Bytes] {
        &self.args
    }
}

/// Conversion of Rust values into bulk-string arguments.
pub trait ToArg {
    fn to_arg(&self) -> Bytes;
}

impl ToArg for &str {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

impl ToArg for String {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

impl ToArg for &String {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

impl ToArg for Bytes {
    fn to_arg(&self) -> Bytes {
        self.clone()
    }
}

impl ToArg for &[u8] {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self)
    }
}

macro_rules! int_to_arg {
    ($($t:ty),*) => {
        $(
            impl ToArg for $t {
                fn to_arg(&self) -> Bytes {
                    Bytes::from(self.to_string())
                }
            }
        )*
    };
}

int_to_arg!(i32, i64, u16, u32, u64, usize);

/// Conversion of reply values into Rust values.
pub trait FromValue: Sized {
    fn from_value(value: Value) -> Result<Self, ClientError>;
}

impl FromValue for Value {
    fn from_value(value: Value) -> Result<Self, ClientError> {
        Ok(value)
    }
}

impl FromValue for () {
    fn from_value(_value: Value) -> Result<Self, ClientError> {
        Ok(())
    }
}

impl FromValue for String {
    fn from_value(value: Value) -> Result<Self, ClientError> {
        match value {
            Value::Data(bytes) => String::from_utf8(bytes.to_vec())
                .map_err(|_| ClientError::UnexpectedReply("bulk string is not UTF-8".into())),
            Value::Status(s) => Ok(s),
            Value::Int(n) => Ok(n.to_string()),
            other => Err(unexpected("string", &other)),
        }
    }
}

impl FromValue for i64 {
    fn from_value(value: Value) -> Result<Self, ClientError> {
        match value {
            Value::Int(n) => Ok(n),
            Value::Data(bytes) => std::str::from_utf8(&bytes)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| {
                    ClientError::UnexpectedReply("bulk string is not an integer".into())
                }),
            other => Err(unexpected("integer", &other)),
        }
    }
}

impl FromValue for bool {
    fn from_value(value: Value) -> Result<Self, ClientError> {
        match value {
            Value::Int(n) => Ok(n != 0),
            Value::Nil => Ok(false),
            Value::Status(s) => Ok(s == "OK"),
            other => Err(unexpected("boolean", &other)),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value) -> Result<Self, ClientError> {
        match value {
            Value::Nil => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

impl<T: FromValue> FromValue for Vec<T> {
    fn from_value(value: Value) -> Result<Self, ClientError> {
        match value {
            Value::Array(items) => items.into_iter().map(T::from_value).collect(),
            Value::Nil => Ok(Vec::new()),
            other => Err(unexpected("array", &other)),
        }
    }
}

fn unexpected(expected: &str, got: &Value) -> ClientError {
    ClientError::UnexpectedReply(format!("expected {}, got {:?}", expected, got))
}

/// Codec encoding [`Command`]s and decoding reply [`Value`]s.
#[derive(Debug, Default)]
pub struct RespCodec;

impl Decoder for RespCodec {
    type Item = Value;
    type Error = ClientError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Value>, ClientError> {
        match parse_value(src, 0)? {
            Some((value, consumed)) => {
                src.advance(consumed);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<Command> for RespCodec {
    type Error = ClientError;

    fn encode(&mut self, cmd: Command, dst: &mut BytesMut) -> Result<(), ClientError> {
        write_header(dst, b'*', cmd.args.len() + 1);
        write_bulk(dst, cmd.name.as_bytes());
        for arg in &cmd.args {
            write_bulk(dst, arg);
        }
        Ok(())
    }
}

fn write_header(dst: &mut BytesMut, prefix: u8, len: usize) {
    dst.put_u8(prefix);
    dst.put_slice(len.to_string().as_bytes());
    dst.put_slice(b"\r\n");
}

fn write_bulk(dst: &mut BytesMut, data: &[u8]) {
    write_header(dst, b'$', data.len());
    dst.put_slice(data);
    dst.put_slice(b"\r\n");
}

/// Parse one value from the front of `data`.
///
/// Returns the value and the number of bytes it occupies, or `None` when
/// `data` holds only part of a frame.
fn parse_value(data: &[u8], depth: usize) -> Result<Option<(Value, usize)>, ClientError> {
    if data.is_empty() {
        return Ok(None);
    }
    if depth > MAX_NESTING_DEPTH {
        return Err(ClientError::Protocol("maximum nesting depth exceeded".into()));
    }

    let Some(line_end) = find_crlf(&data[1..]) else {
        return Ok(None);
    };
    let line = &data[1..1 + line_end];
    let header_len = line_end + 3; // prefix + line + CRLF

    match data[0] {
        b'+' => Ok(Some((Value::Status(lossy(line)), header_len))),
        b'-' => Ok(Some((Value::Error(lossy(line)), header_len))),
        b':' => Ok(Some((Value::Int(parse_int(line)?), header_len))),
        b'$' => {
            let len = parse_int(line)?;
            if len == -1 {
                return Ok(Some((Value::Nil, header_len)));
            }
            let len = usize::try_from(len)
                .map_err(|_| ClientError::Protocol("invalid bulk string length".into()))?;
            if len > MAX_BULK_SIZE {
                return Err(ClientError::Protocol(format!(
                    "bulk string too large: {} > {}",
                    len, MAX_BULK_SIZE
                )));
            }
            let end = header_len + len;
            if data.len() < end + 2 {
                return Ok(None);
            }
            if &data[end..end + 2] != b"\r\n" {
                return Err(ClientError::Protocol("missing CRLF after bulk string".into()));
            }
            let bytes = Bytes::copy_from_slice(&data[header_len..end]);
            Ok(Some((Value::Data(bytes), end + 2)))
        }
        b'*' => {
            let len = parse_int(line)?;
            if len == -1 {
                return Ok(Some((Value::Nil, header_len)));
            }
            let len = usize::try_from(len)
                .map_err(|_| ClientError::Protocol("invalid array length".into()))?;
            if len > MAX_ELEMENTS {
                return Err(ClientError::Protocol(format!(
                    "array too large: {} > {}",
                    len, MAX_ELEMENTS
                )));
            }
            let mut items = Vec::with_capacity(len.min(1024));
            let mut offset = header_len;
            for _ in 0..len {
                match parse_value(&data[offset..], depth + 1)? {
                    Some((item, consumed)) => {
                        items.push(item);
                        offset += consumed;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((Value::Array(items), offset)))
        }
        other => Err(ClientError::Protocol(format!(
            "unknown type byte 0x{:02x}",
            other
        ))),
    }
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}

fn parse_int(line: &[u8]) -> Result<i64, ClientError> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ClientError::Protocol("invalid integer".into()))
}

fn lossy(line: &[u8]) -> String {
    String::from_utf8_lossy(line).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(input: &[u8]) -> (Option<Value>, usize) {
        let mut buf = BytesMut::from(input);
        let value = RespCodec.decode(&mut buf).unwrap();
        (value, buf.len())
    }

    #[test]
    fn decodes_scalar_replies() {
        assert_eq!(decode(b"+OK\r\n"), (Some(Value::Status("OK".into())), 0));
        assert_eq!(
            decode(b"-ERR unknown command\r\n"),
            (Some(Value::Error("ERR unknown command".into())), 0)
        );
        assert_eq!(decode(b":-42\r\n"), (Some(Value::Int(-42)), 0));
        assert_eq!(
            decode(b"$6\r\nfoobar\r\n"),
            (Some(Value::Data(Bytes::from_static(b"foobar"))), 0)
        );
        assert_eq!(decode(b"$-1\r\n"), (Some(Value::Nil), 0));
        assert_eq!(decode(b"*-1\r\n"), (Some(Value::Nil), 0));
        assert_eq!(decode(b"$0\r\n\r\n"), (Some(Value::Data(Bytes::new())), 0));
    }

    #[test]
    fn decodes_nested_arrays() {
        let (value, rest) = decode(b"*2\r\n*1\r\n:1\r\n$3\r\nabc\r\n");
        assert_eq!(rest, 0);
        assert_eq!(
            value,
            Some(Value::Array(vec![
                Value::Array(vec![Value::Int(1)]),
                Value::Data(Bytes::from_static(b"abc")),
            ]))
        );
    }

    #[test]
    fn leaves_incomplete_frames_in_buffer() {
        assert_eq!(decode(b"$6\r\nfoo"), (None, 7));
        assert_eq!(decode(b"*2\r\n:1\r\n"), (None, 8));
        assert_eq!(decode(b"+OK"), (None, 3));
    }

    #[test]
    fn decodes_pipelined_replies_one_at_a_time() {
        let mut buf = BytesMut::from(&b"+OK\r\n:7\r\n"[..]);
        assert_eq!(
            RespCodec.decode(&mut buf).unwrap(),
            Some(Value::Status("OK".into()))
        );
        assert_eq!(RespCodec.decode(&mut buf).unwrap(), Some(Value::Int(7)));
        assert!(buf.is_empty());
    }

    #[test]
    fn rejects_malformed_input() {
        let mut buf = BytesMut::from(&b"?what\r\n"[..]);
        assert!(matches!(
            RespCodec.decode(&mut buf),
            Err(ClientError::Protocol(_))
        ));

        let mut buf = BytesMut::from(&b":abc\r\n"[..]);
        assert!(RespCodec.decode(&mut buf).is_err());

        let mut buf = BytesMut::from(&b"$3\r\nabcXY"[..]);
        assert!(RespCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn rejects_excessive_nesting() {
        let mut input = Vec::new();
        for _ in 0..=MAX_NESTING_DEPTH + 1 {
            input.extend_from_slice(b"*1\r\n");
        }
        input.extend_from_slice(b":1\r\n");
        let mut buf = BytesMut::from(&input[..]);
        assert!(RespCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn encodes_commands_as_bulk_arrays() {
        let mut buf = BytesMut::new();
        let cmd = Command::new("set").arg("key").arg(10i64);
        RespCodec.encode(cmd, &mut buf).unwrap();
        assert_eq!(&buf[..], b"*3\r\n$3\r\nSET\r\n$3\r\nkey\r\n$2\r\n10\r\n");
    }

    #[test]
    fn converts_replies_into_rust_values() {
        assert_eq!(
            Option::<String>::from_value(Value::Data(Bytes::from_static(b"v"))).unwrap(),
            Some("v".to_string())
        );
        assert_eq!(Option::<String>::from_value(Value::Nil).unwrap(), None);
        assert!(bool::from_value(Value::Int(1)).unwrap());
        assert_eq!(i64::from_value(Value::Data(Bytes::from_static(b"12"))).unwrap(), 12);
        assert_eq!(
            Vec::<String>::from_value(Value::Array(vec![
                Value::Data(Bytes::from_static(b"a")),
                Value::Data(Bytes::from_static(b"b")),
            ]))
            .unwrap(),
            vec!["a".to_string(), "b".to_string()]
        );
        assert!(i64::from_value(Value::Array(vec![])).is_err());
    }
}
