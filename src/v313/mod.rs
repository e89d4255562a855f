pub mod opcodes;
