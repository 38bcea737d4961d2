//! Behavioural scenarios for the preflight execution engine.

mod preflight;
