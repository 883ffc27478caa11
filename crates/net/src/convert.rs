//! Conversions between proto types and domain types.

use ringkv_common::{FinishReply, Item, RingUpdate, ShutdownReply};
use ringkv_kv::{KvCommand, KvReply, PushKind};
use ringkv_proto::common as pb;
use ringkv_proto::control as pb_control;
use ringkv_proto::coordinator as pb_coord;
use ringkv_proto::kv as pb_kv;

// ---------------------------------------------------------------------------
// Item / RingUpdate
// ---------------------------------------------------------------------------

pub fn item_to_proto(item: &Item) -> pb::Item {
    pb::Item {
        key: item.key.clone(),
        value: item.value.clone().unwrap_or_default(),
        tombstone: item.is_tombstone(),
        timestamp: item.timestamp,
    }
}

pub fn item_from_proto(proto: pb::Item) -> Item {
    Item {
        key: proto.key,
        value: (!proto.tombstone).then_some(proto.value),
        timestamp: proto.timestamp,
    }
}

pub fn ring_update_to_proto(update: &RingUpdate) -> pb::RingUpdate {
    pb::RingUpdate {
        version: update.version,
        keyrange: update.keyrange.clone(),
    }
}

pub fn ring_update_from_proto(proto: pb::RingUpdate) -> RingUpdate {
    RingUpdate {
        version: proto.version,
        keyrange: proto.keyrange,
    }
}

// ---------------------------------------------------------------------------
// PushKind
// ---------------------------------------------------------------------------

pub fn push_kind_to_proto(kind: PushKind) -> pb_control::PushKind {
    match kind {
        PushKind::Replicate => pb_control::PushKind::Replicate,
        PushKind::Transfer => pb_control::PushKind::Transfer,
    }
}

pub fn push_kind_from_proto(raw: i32) -> Result<PushKind, tonic::Status> {
    match pb_control::PushKind::try_from(raw) {
        Ok(pb_control::PushKind::Replicate) => Ok(PushKind::Replicate),
        Ok(pb_control::PushKind::Transfer) => Ok(PushKind::Transfer),
        Err(_) => Err(tonic::Status::invalid_argument(format!(
            "unknown push kind {}",
            raw
        ))),
    }
}

// ---------------------------------------------------------------------------
// KV commands and replies
// ---------------------------------------------------------------------------

pub fn command_to_proto(cmd: KvCommand) -> pb_kv::Command {
    use pb_kv::command::Op;
    let op = match cmd {
        KvCommand::Put { key, value } => Op::Put(pb_kv::Put { key, value }),
        KvCommand::Get { key } => Op::Get(pb_kv::Get { key }),
        KvCommand::Delete { key } => Op::Delete(pb_kv::Delete { key }),
        KvCommand::Scan { prefix } => Op::Scan(pb_kv::Scan { prefix }),
        KvCommand::KeyRange => Op::KeyRange(pb::Empty {}),
        KvCommand::KeyRangeRead => Op::KeyRangeRead(pb::Empty {}),
    };
    pb_kv::Command { op: Some(op) }
}

pub fn command_from_proto(proto: pb_kv::Command) -> Result<KvCommand, tonic::Status> {
    use pb_kv::command::Op;
    let op = proto
        .op
        .ok_or_else(|| tonic::Status::invalid_argument("missing command"))?;
    Ok(match op {
        Op::Put(p) => KvCommand::Put {
            key: p.key,
            value: p.value,
        },
        Op::Get(g) => KvCommand::Get { key: g.key },
        Op::Delete(d) => KvCommand::Delete { key: d.key },
        Op::Scan(s) => KvCommand::Scan { prefix: s.prefix },
        Op::KeyRange(_) => KvCommand::KeyRange,
        Op::KeyRangeRead(_) => KvCommand::KeyRangeRead,
    })
}

pub fn reply_to_proto(reply: KvReply) -> pb_kv::Reply {
    use pb_kv::reply::Result as R;
    let result = match reply {
        KvReply::Success => R::Success(pb::Empty {}),
        KvReply::Updated => R::Updated(pb::Empty {}),
        KvReply::Value(v) => R::Value(v),
        KvReply::NotFound => R::NotFound(pb::Empty {}),
        KvReply::Items(items) => R::Items(pb_kv::ScanResult {
            items: items
                .into_iter()
                .map(|(key, value)| pb_kv::KeyValue { key, value })
                .collect(),
        }),
        KvReply::KeyRange(keyrange) => R::Keyrange(keyrange),
        KvReply::ServerStopped => R::ServerStopped(pb::Empty {}),
        KvReply::WriteLock => R::WriteLock(pb::Empty {}),
        KvReply::NotResponsible { keyrange } => {
            R::NotResponsible(pb_kv::NotResponsible { keyrange })
        }
        KvReply::Invalid(msg) => R::Invalid(msg),
        KvReply::Failed(msg) => R::Failed(msg),
    };
    pb_kv::Reply {
        result: Some(result),
    }
}

pub fn reply_from_proto(proto: pb_kv::Reply) -> Result<KvReply, tonic::Status> {
    use pb_kv::reply::Result as R;
    let result = proto
        .result
        .ok_or_else(|| tonic::Status::internal("missing reply"))?;
    Ok(match result {
        R::Success(_) => KvReply::Success,
        R::Updated(_) => KvReply::Updated,
        R::Value(v) => KvReply::Value(v),
        R::NotFound(_) => KvReply::NotFound,
        R::Items(scan) => KvReply::Items(
            scan.items
                .into_iter()
                .map(|kv| (kv.key, kv.value))
                .collect(),
        ),
        R::Keyrange(keyrange) => KvReply::KeyRange(keyrange),
        R::ServerStopped(_) => KvReply::ServerStopped,
        R::WriteLock(_) => KvReply::WriteLock,
        R::NotResponsible(nr) => KvReply::NotResponsible {
            keyrange: nr.keyrange,
        },
        R::Invalid(msg) => KvReply::Invalid(msg),
        R::Failed(msg) => KvReply::Failed(msg),
    })
}

// ---------------------------------------------------------------------------
// Coordinator replies
// ---------------------------------------------------------------------------

pub fn finish_to_proto(reply: FinishReply) -> pb_coord::FinishResponse {
    pb_coord::FinishResponse {
        bye: reply == FinishReply::Bye,
    }
}

pub fn finish_from_proto(proto: pb_coord::FinishResponse) -> FinishReply {
    if proto.bye {
        FinishReply::Bye
    } else {
        FinishReply::ReleaseLock
    }
}

pub fn shutdown_to_proto(reply: ShutdownReply) -> pb_coord::ShutdownResponse {
    use pb_coord::shutdown_response::Result as R;
    let result = match reply {
        ShutdownReply::Handoff(update) => R::Handoff(ring_update_to_proto(&update)),
        ShutdownReply::Bye => R::Bye(pb::Empty {}),
    };
    pb_coord::ShutdownResponse {
        result: Some(result),
    }
}

pub fn shutdown_from_proto(
    proto: pb_coord::ShutdownResponse,
) -> Result<ShutdownReply, tonic::Status> {
    use pb_coord::shutdown_response::Result as R;
    match proto.result {
        Some(R::Handoff(update)) => Ok(ShutdownReply::Handoff(ring_update_from_proto(update))),
        Some(R::Bye(_)) => Ok(ShutdownReply::Bye),
        None => Err(tonic::Status::internal("missing shutdown reply")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tombstone_survives_conversion() {
        let tomb = Item::tombstone("gone").with_timestamp(9);
        let proto = item_to_proto(&tomb);
        assert!(proto.tombstone);
        assert!(proto.value.is_empty());
        assert_eq!(item_from_proto(proto), tomb);

        // An empty value is not a tombstone.
        let empty = Item::put("k", Vec::new()).with_timestamp(3);
        assert_eq!(item_from_proto(item_to_proto(&empty)), empty);
    }

    #[test]
    fn test_commands_and_replies() {
        let cmds = vec![
            KvCommand::Put {
                key: "k".into(),
                value: b"v".to_vec(),
            },
            KvCommand::Scan { prefix: "p".into() },
            KvCommand::KeyRangeRead,
        ];
        for cmd in cmds {
            assert_eq!(command_from_proto(command_to_proto(cmd.clone())).unwrap(), cmd);
        }
        assert!(command_from_proto(pb_kv::Command { op: None }).is_err());

        let replies = vec![
            KvReply::Updated,
            KvReply::Items(vec![("a".into(), b"1".to_vec())]),
            KvReply::NotResponsible {
                keyrange: "x".into(),
            },
            KvReply::Failed("disk".into()),
        ];
        for reply in replies {
            assert_eq!(reply_from_proto(reply_to_proto(reply.clone())).unwrap(), reply);
        }
    }

    #[test]
    fn test_push_kind() {
        assert_eq!(
            push_kind_from_proto(push_kind_to_proto(PushKind::Transfer) as i32).unwrap(),
            PushKind::Transfer
        );
        assert!(push_kind_from_proto(42).is_err());
    }
}
