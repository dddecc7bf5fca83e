#![deny(unused_variables)]
#![deny(unused_imports)]

pub mod compare;
pub mod config;
pub mod data;
pub mod diagnostics;
pub mod filter;
pub mod fit;
pub mod hmc;
pub mod model;
pub mod posterior;
pub mod priors;
pub mod psis;
pub mod standardize;
pub mod sweep;

#[path = "../report/mod.rs"]
pub mod report;
