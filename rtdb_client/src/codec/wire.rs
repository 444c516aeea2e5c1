//! Byte-level framing of [`ClientMessage`]/[`ServerMessage`] envelopes: the
//! single discriminator byte per spec §4.1 ("Message variants are sum types
//! with a single-byte discriminator") plus per-field encoding with the same
//! [`WireRead`]/[`WireWrite`] primitives the value codec uses.
//!
//! Table row payloads stay opaque [`Row`] byte blobs here -- per
//! `DESIGN.md`'s resolution of the open question in spec §9, they are
//! decoded into [`crate::codec::AlgebraicValue`] products one layer up, at
//! the table cache boundary, once a table's schema is known.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::io::{WireRead, WireWrite, DEFAULT_MAX_PAYLOAD};
use crate::codec::message::*;
use crate::error::{CodecError, Result};
use crate::identity::{ConnectionId, Identity};
use crate::ids::{QueryId, RequestId};
use crate::time::Timestamp;

pub mod client_tag {
    pub const CALL_REDUCER: u8 = 0;
    pub const SUBSCRIBE: u8 = 1;
    pub const SUBSCRIBE_MULTI: u8 = 2;
    pub const UNSUBSCRIBE: u8 = 3;
    pub const UNSUBSCRIBE_MULTI: u8 = 4;
    pub const ONE_OFF_QUERY: u8 = 5;
}

pub mod server_tag {
    pub const IDENTITY_TOKEN: u8 = 0;
    pub const INITIAL_SUBSCRIPTION: u8 = 1;
    pub const TRANSACTION_UPDATE: u8 = 2;
    pub const TRANSACTION_UPDATE_LIGHT: u8 = 3;
    pub const SUBSCRIBE_APPLIED: u8 = 4;
    pub const UNSUBSCRIBE_APPLIED: u8 = 5;
    pub const SUBSCRIPTION_ERROR: u8 = 6;
    pub const ONE_OFF_QUERY_RESPONSE: u8 = 7;
}

fn write_identity(buf: &mut BytesMut, id: &Identity) {
    buf.put_slice(id.as_bytes());
}

fn read_identity<B: Buf>(buf: &mut B) -> Result<Identity> {
    buf.need(32)?;
    let mut bytes = [0u8; 32];
    buf.copy_to_slice(&mut bytes);
    Ok(Identity::from_bytes(bytes))
}

fn write_connection_id(buf: &mut BytesMut, id: &ConnectionId) {
    buf.put_slice(id.as_bytes());
}

fn read_connection_id<B: Buf>(buf: &mut B) -> Result<ConnectionId> {
    buf.need(16)?;
    let mut bytes = [0u8; 16];
    buf.copy_to_slice(&mut bytes);
    Ok(ConnectionId::from_bytes(bytes))
}

fn write_row(buf: &mut BytesMut, row: &Row) {
    buf.write_bytes_framed(&row.0);
}

fn read_row<B: Buf>(buf: &mut B, max_len: usize) -> Result<Row> {
    Ok(Row(Bytes::from(buf.read_bytes_framed(max_len)?)))
}

fn write_table_update(buf: &mut BytesMut, update: &TableUpdate) {
    buf.write_u32_le(update.table_id);
    buf.write_string_framed(&update.table_name);
    buf.write_u32_le(update.deletes.len() as u32);
    for row in &update.deletes {
        write_row(buf, row);
    }
    buf.write_u32_le(update.inserts.len() as u32);
    for row in &update.inserts {
        write_row(buf, row);
    }
}

fn read_table_update<B: Buf>(buf: &mut B, max_len: usize) -> Result<TableUpdate> {
    let table_id = buf.read_u32_le()?;
    let table_name = buf.read_string_framed(max_len)?;
    let delete_count = buf.read_u32_le()? as usize;
    if delete_count > max_len {
        return Err(CodecError::TooLarge { size: delete_count, max: max_len }.into());
    }
    let mut deletes = Vec::with_capacity(delete_count.min(4096));
    for _ in 0..delete_count {
        deletes.push(read_row(buf, max_len)?);
    }
    let insert_count = buf.read_u32_le()? as usize;
    if insert_count > max_len {
        return Err(CodecError::TooLarge { size: insert_count, max: max_len }.into());
    }
    let mut inserts = Vec::with_capacity(insert_count.min(4096));
    for _ in 0..insert_count {
        inserts.push(read_row(buf, max_len)?);
    }
    Ok(TableUpdate { table_id, table_name, deletes, inserts })
}

fn write_database_update(buf: &mut BytesMut, update: &DatabaseUpdate) {
    buf.write_u32_le(update.tables.len() as u32);
    for table in &update.tables {
        write_table_update(buf, table);
    }
}

fn read_database_update<B: Buf>(buf: &mut B, max_len: usize) -> Result<DatabaseUpdate> {
    let count = buf.read_u32_le()? as usize;
    if count > max_len {
        return Err(CodecError::TooLarge { size: count, max: max_len }.into());
    }
    let mut tables = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        tables.push(read_table_update(buf, max_len)?);
    }
    Ok(DatabaseUpdate { tables })
}

/// Encodes a [`ClientMessage`] as a one-byte variant tag followed by its
/// fields, per spec §6's message surface.
pub fn encode_client_message(buf: &mut BytesMut, msg: &ClientMessage) -> Result<()> {
    match msg {
        ClientMessage::CallReducer(m) => {
            buf.write_u8(client_tag::CALL_REDUCER);
            match &m.reducer {
                ReducerId::Name(name) => buf.write_string_framed(name),
            }
            buf.write_bytes_framed(&m.args);
            buf.write_u32_le(m.request_id.get());
            buf.write_u8(m.flags.0);
        }
        ClientMessage::Subscribe(m) => {
            buf.write_u8(client_tag::SUBSCRIBE);
            buf.write_u32_le(m.query_strings.len() as u32);
            for q in &m.query_strings {
                buf.write_string_framed(q);
            }
            buf.write_u32_le(m.request_id.get());
            buf.write_u32_le(m.query_id.get());
        }
        ClientMessage::SubscribeMulti(m) => {
            buf.write_u8(client_tag::SUBSCRIBE_MULTI);
            buf.write_u32_le(m.query_strings.len() as u32);
            for q in &m.query_strings {
                buf.write_string_framed(q);
            }
            buf.write_u32_le(m.request_id.get());
            buf.write_u32_le(m.query_id.get());
        }
        ClientMessage::Unsubscribe(m) => {
            buf.write_u8(client_tag::UNSUBSCRIBE);
            buf.write_u32_le(m.request_id.get());
            buf.write_u32_le(m.query_id.get());
        }
        ClientMessage::UnsubscribeMulti(m) => {
            buf.write_u8(client_tag::UNSUBSCRIBE_MULTI);
            buf.write_u32_le(m.request_id.get());
            buf.write_u32_le(m.query_id.get());
        }
        ClientMessage::OneOffQuery(m) => {
            buf.write_u8(client_tag::ONE_OFF_QUERY);
            buf.write_bytes_framed(&m.message_id);
            buf.write_string_framed(&m.query_string);
        }
    }
    Ok(())
}

pub fn encode_client_message_to_vec(msg: &ClientMessage) -> Result<Vec<u8>> {
    let mut buf = BytesMut::new();
    encode_client_message(&mut buf, msg)?;
    Ok(buf.to_vec())
}

pub fn decode_client_message<B: Buf>(buf: &mut B) -> Result<ClientMessage> {
    decode_client_message_with_limit(buf, DEFAULT_MAX_PAYLOAD)
}

pub fn decode_client_message_with_limit<B: Buf>(buf: &mut B, max_len: usize) -> Result<ClientMessage> {
    let tag = buf.read_u8()?;
    Ok(match tag {
        client_tag::CALL_REDUCER => {
            let name = buf.read_string_framed(max_len)?;
            let args = Bytes::from(buf.read_bytes_framed(max_len)?);
            let request_id = RequestId(buf.read_u32_le()?);
            let flags = CallReducerFlags(buf.read_u8()?);
            ClientMessage::CallReducer(CallReducer { reducer: ReducerId::Name(name), args, request_id, flags })
        }
        client_tag::SUBSCRIBE => {
            let count = buf.read_u32_le()? as usize;
            if count > max_len {
                return Err(CodecError::TooLarge { size: count, max: max_len }.into());
            }
            let mut query_strings = Vec::with_capacity(count.min(4096));
            for _ in 0..count {
                query_strings.push(buf.read_string_framed(max_len)?);
            }
            let request_id = RequestId(buf.read_u32_le()?);
            let query_id = QueryId(buf.read_u32_le()?);
            ClientMessage::Subscribe(Subscribe { query_strings, request_id, query_id })
        }
        client_tag::SUBSCRIBE_MULTI => {
            let count = buf.read_u32_le()? as usize;
            if count > max_len {
                return Err(CodecError::TooLarge { size: count, max: max_len }.into());
            }
            let mut query_strings = Vec::with_capacity(count.min(4096));
            for _ in 0..count {
                query_strings.push(buf.read_string_framed(max_len)?);
            }
            let request_id = RequestId(buf.read_u32_le()?);
            let query_id = QueryId(buf.read_u32_le()?);
            ClientMessage::SubscribeMulti(SubscribeMulti { query_strings, request_id, query_id })
        }
        client_tag::UNSUBSCRIBE => {
            let request_id = RequestId(buf.read_u32_le()?);
            let query_id = QueryId(buf.read_u32_le()?);
            ClientMessage::Unsubscribe(Unsubscribe { request_id, query_id })
        }
        client_tag::UNSUBSCRIBE_MULTI => {
            let request_id = RequestId(buf.read_u32_le()?);
            let query_id = QueryId(buf.read_u32_le()?);
            ClientMessage::UnsubscribeMulti(UnsubscribeMulti { request_id, query_id })
        }
        client_tag::ONE_OFF_QUERY => {
            let message_id = buf.read_bytes_framed(max_len)?;
            let query_string = buf.read_string_framed(max_len)?;
            ClientMessage::OneOffQuery(OneOffQuery { message_id, query_string })
        }
        found => return Err(CodecError::InvalidTag { expected: 0, found }.into()),
    })
}

/// Encodes a [`ServerMessage`] as a one-byte variant tag followed by its
/// fields, per spec §6.
pub fn encode_server_message(buf: &mut BytesMut, msg: &ServerMessage) -> Result<()> {
    match msg {
        ServerMessage::IdentityToken(m) => {
            buf.write_u8(server_tag::IDENTITY_TOKEN);
            write_identity(buf, &m.identity);
            buf.write_string_framed(&m.token);
            write_connection_id(buf, &m.connection_id);
        }
        ServerMessage::InitialSubscription(m) => {
            buf.write_u8(server_tag::INITIAL_SUBSCRIPTION);
            write_database_update(buf, &m.database_update);
            buf.write_u32_le(m.request_id.get());
            buf.write_u64_le(m.total_host_execution_duration_micros);
        }
        ServerMessage::TransactionUpdate(m) => {
            buf.write_u8(server_tag::TRANSACTION_UPDATE);
            match &m.status {
                UpdateStatus::Committed(update) => {
                    buf.write_u8(0);
                    write_database_update(buf, update);
                }
                UpdateStatus::Failed(reason) => {
                    buf.write_u8(1);
                    buf.write_string_framed(reason);
                }
                UpdateStatus::OutOfEnergy => buf.write_u8(2),
            }
            buf.write_i64_le(m.timestamp.as_micros());
            write_identity(buf, &m.caller_identity);
            write_connection_id(buf, &m.caller_connection_id);
            buf.write_string_framed(&m.reducer_call.reducer_name);
            buf.write_u32_le(m.reducer_call.reducer_id);
            buf.write_bytes_framed(&m.reducer_call.args);
            buf.write_u32_le(m.reducer_call.request_id.get());
            buf.write_i64_le(m.energy_quanta_used.0);
            buf.write_u64_le(m.host_execution_duration_micros);
        }
        ServerMessage::TransactionUpdateLight(m) => {
            buf.write_u8(server_tag::TRANSACTION_UPDATE_LIGHT);
            buf.write_u32_le(m.query_id.get());
            write_database_update(buf, &m.update);
        }
        ServerMessage::SubscribeApplied(m) => {
            buf.write_u8(server_tag::SUBSCRIBE_APPLIED);
            buf.write_u32_le(m.request_id.get());
            buf.write_u32_le(m.query_id.get());
            write_table_update(buf, &m.rows);
        }
        ServerMessage::UnsubscribeApplied(m) => {
            buf.write_u8(server_tag::UNSUBSCRIBE_APPLIED);
            buf.write_u32_le(m.request_id.get());
            buf.write_u32_le(m.query_id.get());
            write_table_update(buf, &m.rows);
        }
        ServerMessage::SubscriptionError(m) => {
            buf.write_u8(server_tag::SUBSCRIPTION_ERROR);
            match m.request_id {
                Some(id) => {
                    buf.write_u8(1);
                    buf.write_u32_le(id.get());
                }
                None => buf.write_u8(0),
            }
            match m.query_id {
                Some(id) => {
                    buf.write_u8(1);
                    buf.write_u32_le(id.get());
                }
                None => buf.write_u8(0),
            }
            buf.write_string_framed(&m.error);
        }
        ServerMessage::OneOffQueryResponse(m) => {
            buf.write_u8(server_tag::ONE_OFF_QUERY_RESPONSE);
            buf.write_bytes_framed(&m.message_id);
            match &m.error {
                Some(e) => {
                    buf.write_u8(1);
                    buf.write_string_framed(e);
                }
                None => buf.write_u8(0),
            }
            buf.write_u32_le(m.tables.len() as u32);
            for table in &m.tables {
                buf.write_string_framed(&table.table_name);
                buf.write_u32_le(table.rows.len() as u32);
                for row in &table.rows {
                    write_row(buf, row);
                }
            }
            buf.write_u64_le(m.total_host_execution_duration_micros);
        }
    }
    Ok(())
}

pub fn encode_server_message_to_vec(msg: &ServerMessage) -> Result<Vec<u8>> {
    let mut buf = BytesMut::new();
    encode_server_message(&mut buf, msg)?;
    Ok(buf.to_vec())
}

pub fn decode_server_message<B: Buf>(buf: &mut B) -> Result<ServerMessage> {
    decode_server_message_with_limit(buf, DEFAULT_MAX_PAYLOAD)
}

pub fn decode_server_message_with_limit<B: Buf>(buf: &mut B, max_len: usize) -> Result<ServerMessage> {
    let tag = buf.read_u8()?;
    Ok(match tag {
        server_tag::IDENTITY_TOKEN => {
            let identity = read_identity(buf)?;
            let token = buf.read_string_framed(max_len)?;
            let connection_id = read_connection_id(buf)?;
            ServerMessage::IdentityToken(IdentityTokenMessage { identity, token, connection_id })
        }
        server_tag::INITIAL_SUBSCRIPTION => {
            let database_update = read_database_update(buf, max_len)?;
            let request_id = RequestId(buf.read_u32_le()?);
            let total_host_execution_duration_micros = buf.read_u64_le()?;
            ServerMessage::InitialSubscription(InitialSubscription {
                database_update,
                request_id,
                total_host_execution_duration_micros,
            })
        }
        server_tag::TRANSACTION_UPDATE => {
            let status_tag = buf.read_u8()?;
            let status = match status_tag {
                0 => UpdateStatus::Committed(read_database_update(buf, max_len)?),
                1 => UpdateStatus::Failed(buf.read_string_framed(max_len)?),
                2 => UpdateStatus::OutOfEnergy,
                found => return Err(CodecError::InvalidTag { expected: 2, found }.into()),
            };
            let timestamp = Timestamp::from_micros(buf.read_i64_le()?);
            let caller_identity = read_identity(buf)?;
            let caller_connection_id = read_connection_id(buf)?;
            let reducer_name = buf.read_string_framed(max_len)?;
            let reducer_id = buf.read_u32_le()?;
            let args = Bytes::from(buf.read_bytes_framed(max_len)?);
            let request_id = RequestId(buf.read_u32_le()?);
            let energy_quanta_used = EnergyQuanta(buf.read_i64_le()?);
            let host_execution_duration_micros = buf.read_u64_le()?;
            ServerMessage::TransactionUpdate(TransactionUpdate {
                status,
                timestamp,
                caller_identity,
                caller_connection_id,
                reducer_call: ReducerCallInfo { reducer_name, reducer_id, args, request_id },
                energy_quanta_used,
                host_execution_duration_micros,
            })
        }
        server_tag::TRANSACTION_UPDATE_LIGHT => {
            let query_id = QueryId(buf.read_u32_le()?);
            let update = read_database_update(buf, max_len)?;
            ServerMessage::TransactionUpdateLight(TransactionUpdateLight { query_id, update })
        }
        server_tag::SUBSCRIBE_APPLIED => {
            let request_id = RequestId(buf.read_u32_le()?);
            let query_id = QueryId(buf.read_u32_le()?);
            let rows = read_table_update(buf, max_len)?;
            ServerMessage::SubscribeApplied(SubscribeApplied { request_id, query_id, rows })
        }
        server_tag::UNSUBSCRIBE_APPLIED => {
            let request_id = RequestId(buf.read_u32_le()?);
            let query_id = QueryId(buf.read_u32_le()?);
            let rows = read_table_update(buf, max_len)?;
            ServerMessage::UnsubscribeApplied(UnsubscribeApplied { request_id, query_id, rows })
        }
        server_tag::SUBSCRIPTION_ERROR => {
            let request_id = match buf.read_u8()? {
                1 => Some(RequestId(buf.read_u32_le()?)),
                _ => None,
            };
            let query_id = match buf.read_u8()? {
                1 => Some(QueryId(buf.read_u32_le()?)),
                _ => None,
            };
            let error = buf.read_string_framed(max_len)?;
            ServerMessage::SubscriptionError(SubscriptionErrorMessage { request_id, query_id, error })
        }
        server_tag::ONE_OFF_QUERY_RESPONSE => {
            let message_id = buf.read_bytes_framed(max_len)?;
            let error = match buf.read_u8()? {
                1 => Some(buf.read_string_framed(max_len)?),
                _ => None,
            };
            let table_count = buf.read_u32_le()? as usize;
            if table_count > max_len {
                return Err(CodecError::TooLarge { size: table_count, max: max_len }.into());
            }
            let mut tables = Vec::with_capacity(table_count.min(4096));
            for _ in 0..table_count {
                let table_name = buf.read_string_framed(max_len)?;
                let row_count = buf.read_u32_le()? as usize;
                if row_count > max_len {
                    return Err(CodecError::TooLarge { size: row_count, max: max_len }.into());
                }
                let mut rows = Vec::with_capacity(row_count.min(4096));
                for _ in 0..row_count {
                    rows.push(read_row(buf, max_len)?);
                }
                tables.push(OneOffTable { table_name, rows });
            }
            let total_host_execution_duration_micros = buf.read_u64_le()?;
            ServerMessage::OneOffQueryResponse(OneOffQueryResponse {
                message_id,
                error,
                tables,
                total_host_execution_duration_micros,
            })
        }
        found => return Err(CodecError::InvalidTag { expected: 0, found }.into()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_call_reducer_roundtrips() {
        let msg = ClientMessage::CallReducer(CallReducer {
            reducer: ReducerId::Name("send_message".into()),
            args: Bytes::from_static(b"\x01\x02"),
            request_id: RequestId(7),
            flags: CallReducerFlags::NO_SUCCESS_NOTIFY,
        });
        let bytes = encode_client_message_to_vec(&msg).unwrap();
        let mut cursor = Bytes::from(bytes);
        let decoded = decode_client_message(&mut cursor).unwrap();
        match decoded {
            ClientMessage::CallReducer(m) => {
                assert!(matches!(m.reducer, ReducerId::Name(ref n) if n == "send_message"));
                assert_eq!(m.request_id, RequestId(7));
                assert!(m.flags.contains(CallReducerFlags::NO_SUCCESS_NOTIFY));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn server_identity_token_roundtrips() {
        let msg = ServerMessage::IdentityToken(IdentityTokenMessage {
            identity: Identity::from_bytes([1u8; 32]),
            token: "tok_abc".into(),
            connection_id: ConnectionId::from_bytes([0xAA; 16]),
        });
        let bytes = encode_server_message_to_vec(&msg).unwrap();
        let mut cursor = Bytes::from(bytes);
        let decoded = decode_server_message(&mut cursor).unwrap();
        match decoded {
            ServerMessage::IdentityToken(m) => {
                assert_eq!(m.token, "tok_abc");
                assert_eq!(m.identity, Identity::from_bytes([1u8; 32]));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn server_transaction_update_with_pk_delta_roundtrips() {
        let msg = ServerMessage::TransactionUpdate(TransactionUpdate {
            status: UpdateStatus::Committed(DatabaseUpdate {
                tables: vec![TableUpdate {
                    table_id: 1,
                    table_name: "users".into(),
                    deletes: vec![Row(Bytes::from_static(b"old"))],
                    inserts: vec![Row(Bytes::from_static(b"new"))],
                }],
            }),
            timestamp: Timestamp::from_micros(1_000),
            caller_identity: Identity::ANONYMOUS,
            caller_connection_id: ConnectionId::ZERO,
            reducer_call: ReducerCallInfo {
                reducer_name: "rename".into(),
                reducer_id: 3,
                args: Bytes::new(),
                request_id: RequestId(1),
            },
            energy_quanta_used: EnergyQuanta(100),
            host_execution_duration_micros: 50,
        });
        let bytes = encode_server_message_to_vec(&msg).unwrap();
        let mut cursor = Bytes::from(bytes);
        let decoded = decode_server_message(&mut cursor).unwrap();
        match decoded {
            ServerMessage::TransactionUpdate(m) => match m.status {
                UpdateStatus::Committed(update) => {
                    assert_eq!(update.tables[0].deletes[0].0, Bytes::from_static(b"old"));
                    assert_eq!(update.tables[0].inserts[0].0, Bytes::from_static(b"new"));
                }
                _ => panic!("expected committed"),
            },
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn unknown_client_tag_is_rejected() {
        let bytes = vec![99u8];
        let mut cursor = Bytes::from(bytes);
        assert!(decode_client_message(&mut cursor).is_err());
    }
}
