pub mod queue;
pub mod rest;
