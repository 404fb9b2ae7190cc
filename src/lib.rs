//! Claude models on Google Cloud Vertex AI, plus the tooling around them:
//! a gcloud preflight checker and a cassette decompressor for test fixtures.

pub mod cassette;
pub mod config;
pub mod llm;
pub mod setup;
pub mod utils;
