//! Property-based tests for the tiered memory store.
//!
//! These tests check invariants that must hold after every operation:
//!
//! - Transient tiers never exceed their capacity
//! - Entries only move forward through the tiers
//! - Export followed by import reproduces the store exactly
