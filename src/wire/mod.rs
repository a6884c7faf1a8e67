//! The AMQP 0-9-1 wire codec: frames, method arguments, content headers,
//! and field tables.
//!
//! Everything above this module works with the decoded [`AmqpFrame`] /
//! [`AmqpClass`] types; everything below it is bytes.

pub mod constants;
pub mod frame;
pub mod method;
pub mod properties;
pub mod types;

pub use frame::{AmqpFrame, ContentHeader};
pub use method::AmqpClass;
pub use properties::AmqpProperties;
pub use types::{Decimal, EncodeError, FieldTable, FieldValue};
