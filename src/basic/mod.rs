pub mod angle;
pub mod classify;
pub mod config;
pub mod dcpf;
pub mod driver;
pub mod error;
pub mod fdpf;
pub mod gausspf;
pub mod mismatch;
pub mod network;
pub mod newtonpf;
pub mod post_processing;
pub mod qlim;
pub mod solver;
pub(crate) mod sparse;
pub mod state;

pub use driver::{PowerFlow, PowerFlowResult, drive, run_pf};
