//! Default implementations of [crate::connector::Connector]

pub mod tcp;
