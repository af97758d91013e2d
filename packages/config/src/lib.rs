// ABOUTME: Shared configuration primitives for Knapsack packages
// ABOUTME: Exposes environment variable names and typed env parsing helpers

pub mod constants;
pub mod env;

pub use env::{env_or, optional_env, parse_words, required_env, EnvError};
