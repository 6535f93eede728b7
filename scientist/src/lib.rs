//! Scientist - autonomous experimentation loop
//!
//! Agents cooperate over an in-process topic bus. The Director owns the
//! cycle and budget; the Planner, Reviewer, Executor and Analysis agents
//! react to its events and record everything in the world model.

pub mod actors;
pub mod config;
pub mod llm;
pub mod scientist;
pub mod world_model;

#[cfg(test)]
mod test_support;
