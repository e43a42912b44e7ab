//! framelink-protocol – Wire-Format
//!
//! Dieses Crate definiert, wie eine strukturierte Nachricht als Frame ueber
//! eine TCP-Verbindung laeuft. Der Endpoint konsumiert nur den
//! `FrameCodec`; das Byte-Format ist hier gekapselt.

pub mod wire;

pub use wire::{
    read_frame, write_frame, FrameCodec, DEFAULT_MAX_FRAME_SIZE, LENGTH_FIELD_SIZE,
    MAX_DARSTELLBARE_GROESSE,
};
