// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod arguments;
mod otel;

pub mod channel;
pub mod config;
pub mod consumer;
pub mod errors;
pub mod exchange;
pub mod message;
pub mod name_resolver;
pub mod publisher;
pub mod queue;
pub mod registry;
pub mod subscription;
pub mod temporary_queue;
pub mod topology;
