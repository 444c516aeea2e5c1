//! Wire protocol codec: the tagged value/type tree, message framing, and
//! compression negotiation (spec §3 "wire protocol codec", 15% of the
//! component share).

pub mod de;
pub mod io;
pub mod message;
pub mod registry;
pub mod ser;
pub mod typed;
pub mod value;
pub mod wire;

pub use de::{decode, decode_with_limit};
pub use message::{ClientMessage, ServerMessage};
pub use registry::{TypeRef, TypeRegistry};
pub use ser::{encode, encode_to_vec};
pub use typed::{AlgebraicTyped, Row};
pub use value::{AlgebraicType, AlgebraicValue, ProductField, SumVariant};
pub use wire::{
    decode_client_message, decode_client_message_with_limit, decode_server_message,
    decode_server_message_with_limit, encode_client_message, encode_client_message_to_vec,
    encode_server_message, encode_server_message_to_vec,
};
