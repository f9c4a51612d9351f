pub mod config;         // loads certserver.toml or unit.toml
pub mod crypto;         // authority key, root generation, certificate signing (openssl)
pub mod error;          // error taxonomy shared by every component
pub mod gateway;        // gateway pinning / ARP spoof detection
pub mod identity;       // unit roles, enrollment body validation, subject derivation
pub mod network;        // gateway discovery and ARP table primitives
pub mod operator;       // blocking operator prompts
pub mod renewal;        // certificate renewal client
pub mod secret;         // passphrase + key acquisition channels
pub mod storage;        // atomic file persistence for certs and settings
pub mod trust;          // root certificate fetch and pinning
pub mod utils;          // PEM helpers, forwarded client ip
pub mod mode;           // per-binary orchestration logic
pub mod handlers;       // handlers for Axum API
