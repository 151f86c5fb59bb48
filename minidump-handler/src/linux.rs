#![cfg(any(target_os = "linux", target_os = "android"))]

pub(crate) mod cpu_context;
mod elf;
mod file_writer;
pub(crate) mod handler;
mod minidump_writer;
mod snapshot;
mod ucontext;
