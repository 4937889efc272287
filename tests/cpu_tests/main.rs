//! Thread CPU accounting integration tests

mod threshold_tests;
