//! Generated gRPC types and service stubs for the controller<->agent
//! channel, compiled from `proto/controller.proto` by `tonic-build`.

#![allow(clippy::pedantic)]

tonic::include_proto!("sitekeeper.controller.v1");
