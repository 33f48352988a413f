//! Fee Ledger Service - per-student fee reconciliation for multi-tenant
//! school accounting.

pub mod config;
pub mod models;
pub mod services;
pub mod startup;
