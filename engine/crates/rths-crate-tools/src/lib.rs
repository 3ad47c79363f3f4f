pub mod init_log;
pub mod named_array;
pub mod resource;
