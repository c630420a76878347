// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backing-store drivers.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  traits.rs   - Backend contract + StorageError               │
//! │  memory.rs   - DashMap document store (tests, embedded)      │
//! │  redis.rs    - Hashes for Records, sets for Sets             │
//! │  sql.rs      - sqlx Any (SQLite/MySQL), one JSON row per key │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod traits;
pub mod memory;
pub mod redis;
pub mod sql;
