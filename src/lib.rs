//! CashHandle - tokens backed by HandCash handles, with a marketplace and Divvy dividends
//!
//! # Architecture
//!
//! The crate is organized into logical modules:
//!
//! ## Domain
//! - [`tokens`] - Token symbols, supply and market metrics
//! - [`marketplace`] - Sell order rules
//! - [`divvy`] - Pro-rata dividend planning and batch payouts
//! - [`monitor`] - Background processing of incoming handle payments
//! - [`models`] - Stored records
//!
//! ## Integrations
//! - [`handcash`] - Identity provider (HandCash Connect and a development provider)
//! - [`bsv`] - Chain wallet for ordinal inscriptions (secp256k1)
//!
//! ## State Management
//! - [`persistence`] - Database layer (SQLite)
//! - [`session`] - Signed session cookies
//!
//! ## Interfaces
//! - [`api`] - REST API server
//! - [`cli`] - Helpers for the admin tool
//! - [`demo`] - Showcase data
//!
//! ## Configuration & Utilities
//! - [`config`] - Configuration management
//! - [`error`] - Error types

#![forbid(unsafe_code)]

// ============================================================================
// Domain
// ============================================================================
pub mod divvy;
pub mod marketplace;
pub mod models;
pub mod monitor;
pub mod tokens;

// ============================================================================
// Integrations
// ============================================================================
pub mod bsv;
pub mod handcash;

// ============================================================================
// State Management
// ============================================================================
pub mod persistence;
pub mod session;

// ============================================================================
// Interfaces
// ============================================================================
pub mod api;
pub mod cli;
pub mod demo;

// ============================================================================
// Configuration & Utilities
// ============================================================================
pub mod config;
pub mod error;
