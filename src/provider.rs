//! AI供应商
pub mod anthropic;
