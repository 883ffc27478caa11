//! Generated gRPC code for the ringkv protobuf definitions.

/// Shared messages (Item, RingUpdate, Empty).
pub mod common {
    tonic::include_proto!("ringkv.common");
}

/// Client-facing KV service (Execute with a command oneof).
pub mod kv {
    tonic::include_proto!("ringkv.kv");
}

/// Node control service (UpdateRing, SetWriteLock, Heartbeat, PushItem).
pub mod control {
    tonic::include_proto!("ringkv.control");
}

/// Coordinator service (Register, Finish, Shutdown, address lookups).
pub mod coordinator {
    tonic::include_proto!("ringkv.coordinator");
}
