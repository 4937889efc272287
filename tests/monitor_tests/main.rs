//! Monitor adapter integration tests

mod monitor_tests;
