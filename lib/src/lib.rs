//! # Image composer
//!
//! This crate installs an operating system described by an image template into
//! externally provisioned partitions: it mounts them below a chroot, installs
//! packages, writes base configuration, installs a bootloader, builds a unified
//! kernel image and optionally signs it for secure boot.

// See https://doc.rust-lang.org/rustc/lints/listing/allowed-by-default.html
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![forbid(unused_must_use)]
#![deny(unsafe_code)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::todo)]

pub mod cli;
pub mod error;
pub mod fstab;
pub mod install;
pub mod mount;
pub mod packages;
pub mod repos;
pub mod secureboot;
pub mod task;
pub mod template;
pub mod uki;

mod bootloader;

#[cfg(test)]
mod fixture;
