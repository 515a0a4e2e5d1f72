//! Wire protocols spoken to the CDU

pub mod modbus;
