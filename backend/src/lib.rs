pub mod legacy_proto {
    tonic::include_proto!("proto");
}

pub mod alerting;
pub mod db;
pub mod legacy;
pub mod notifications;
pub mod rpc;
pub mod server;
pub mod version;
pub mod web;
