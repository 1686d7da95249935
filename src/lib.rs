// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! This crate provides the cyclic core of a Sercos III fieldbus master
//! # Examples
//! ```no_run
//! # extern crate sercos3;
//! # use sercos3::{constant::Phase, master::{Master, Options}, sim::SoftFpga};
//!
//! # fn main() {
//!     let mut master = match Master::open(SoftFpga::new(), Default::default(), Options::default()) {
//!         Ok(m) => m,
//!         Err(e) => {
//!             println!("{:?}", e.to_string());
//!             return;
//!         }
//!     };
//!
//!     master.project_slaves(&[3, 5]).unwrap();
//!     master.set_phase(Phase::Cp0).unwrap();
//!
//!     // once per Sercos cycle, from the cycle interrupt
//!     let result = master.cyclic_handling();
//!     println!("cycle result: {:?}", result);
//! # }
//! ```
pub mod binconfig;
pub mod config;
pub mod connection;
pub mod constant;
mod cyclic;
mod dma;
pub mod error;
pub mod hal;
pub mod master;
pub mod sim;

mod layout;
