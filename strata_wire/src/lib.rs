//! Wire-level building blocks shared by every strata transport.

pub mod address;
pub mod codec;
pub mod envelope;
pub mod error;
pub mod grpc_web;
pub mod pool;
pub mod target;

pub use address::{parse_address, parse_address_strict, ParsedAddress, Scheme};
pub use codec::{parse_identifier, read_u16, read_varint, write_u16, write_varint, Identifier};
pub use error::{FrameError, ParseError};
pub use grpc_web::{decode_frame, encode_frame, Frame, FrameHeader, FrameReader, FrameWriter};
pub use pool::{BufferPool, PooledBuffer, SizeClass};
pub use target::TargetAddr;
