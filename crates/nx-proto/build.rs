fn main() {
    // Message types are hand-written prost structs in src/lib.rs; only the
    // service glue (trait, server, client) is generated here.
    let service = tonic_build::manual::Service::builder()
        .name("NexusService")
        .package("nexus.bus")
        .method(
            tonic_build::manual::Method::builder()
                .name("emit_event")
                .route_name("EmitEvent")
                .input_type("crate::EventRequest")
                .output_type("crate::EventResponse")
                .codec_path("tonic::codec::ProstCodec")
                .build(),
        )
        .method(
            tonic_build::manual::Method::builder()
                .name("subscribe_events")
                .route_name("SubscribeEvents")
                .input_type("crate::SubscribeRequest")
                .output_type("crate::WireEnvelope")
                .server_streaming()
                .codec_path("tonic::codec::ProstCodec")
                .build(),
        )
        .method(
            tonic_build::manual::Method::builder()
                .name("register_pattern")
                .route_name("RegisterPattern")
                .input_type("crate::PatternRequest")
                .output_type("crate::PatternResponse")
                .codec_path("tonic::codec::ProstCodec")
                .build(),
        )
        .build();

    tonic_build::manual::Builder::new().compile(&[service]);
}
