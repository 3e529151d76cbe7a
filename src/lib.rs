//! Control plane and live-debug broker for reverse-engineering DOS programs
//! running under an emulator. Two very different emulator surfaces, a
//! socket-driven one (machine-control JSON over a Unix socket plus a
//! remote-debug stub over TCP) and a session-driven one (one scripted
//! emulator run per operation), sit behind one contract for memory,
//! registers, breakpoints, execution control, snapshots, input injection,
//! screenshots and golden-file capture.

pub mod address;
pub mod backend;
pub mod capture;
pub mod dosbox;
pub mod error;
pub mod log;
pub mod qemu;
pub mod register;
pub mod server;
