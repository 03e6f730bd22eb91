//! Shared harness for the end-to-end suites.
//!
//! Most suites run the real coordinator and router against a [`mocks::MockSource`]
//! and an in-memory store. The `postgres` suite needs Docker (or
//! `CHATLOG_TEST_POSTGRES_HOST`) and is ignored by default.

pub mod containers;
pub mod mocks;
pub mod setup;
