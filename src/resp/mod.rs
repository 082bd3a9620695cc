pub mod parser;
pub mod types;
pub mod writer;

pub use parser::{parse, parse_slice, RespParser};
pub use types::RedisValue;
pub use writer::{encode_command, encode_command_bytes, encode_value};
