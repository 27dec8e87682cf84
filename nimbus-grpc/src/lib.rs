//! Generated gRPC client stubs for the control and input planes.
//!
//! The core never constructs these messages by hand in application code;
//! it only depends on the shapes here being stable. Regenerated from
//! `proto/*.proto` on every build.

pub mod proto {
    pub mod control {
        tonic::include_proto!("nimbus.api.v1");
    }

    pub mod input {
        tonic::include_proto!("nimbus.api.input.v1");
    }
}
