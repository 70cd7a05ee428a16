//! Generates the `keel.sync.AgentSync` gRPC client and server stubs.
//!
//! Messages are hand-written prost structs in `src/proto.rs`, so the
//! service is described with tonic-build's manual builder instead of a
//! `.proto` file.

use tonic_build::manual::{Builder, Method, Service};

const WATCH_REQUEST: &str = "crate::proto::WatchRequest";
const ENVELOPE: &str = "crate::proto::Envelope";

fn unary(name: &str, route: &str) -> Method {
    Method::builder()
        .name(name)
        .route_name(route)
        .input_type(ENVELOPE)
        .output_type(ENVELOPE)
        .codec_path("tonic::codec::ProstCodec")
        .build()
}

fn streaming(name: &str, route: &str) -> Method {
    Method::builder()
        .name(name)
        .route_name(route)
        .input_type(WATCH_REQUEST)
        .output_type(ENVELOPE)
        .codec_path("tonic::codec::ProstCodec")
        .server_streaming()
        .build()
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let service = Service::builder()
        .name("AgentSync")
        .package("keel.sync")
        .method(streaming("watch", "Watch"))
        .method(streaming("get_desired_state", "GetDesiredState"))
        .method(unary("get_desired_deployment_state", "GetDesiredDeploymentState"))
        .method(unary("get_desired_sentinel_state", "GetDesiredSentinelState"))
        .method(unary("get_desired_gateway_state", "GetDesiredGatewayState"))
        .method(unary("update_instance_state", "UpdateInstanceState"))
        .method(unary("update_sentinel_state", "UpdateSentinelState"))
        .method(unary("update_gateway_state", "UpdateGatewayState"))
        .method(unary("update_deployment_status", "UpdateDeploymentStatus"))
        .build();

    Builder::new().compile(&[service]);
}
