pub mod authorizer;
pub mod chunk_store;
pub mod duplicate;
pub mod intake;
pub mod moderation;
pub mod pipeline;
pub mod quality;
pub mod reassembly;
pub mod session_manager;
pub mod storage;
pub mod validation;
pub mod verdict_sink;
pub mod worker;
