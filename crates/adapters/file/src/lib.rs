//! mcpgw-adapter-file - 加密文件会话存储
//!
//! 每个会话一个加密文件，写入经临时文件 + rename 保证原子性。
//! 内存中维护会话索引，启动时扫描目录重建。

mod layout;
mod store;

pub use store::*;
