//! TFTP (Trivial File Transfer Protocol) 实现
//!
//! 本模块实现 [RFC 1350](https://www.rfc-editor.org/rfc/rfc1350) TFTP 协议
//! 版本 2，仅支持 octet 模式，固定 512 字节数据块，不支持选项扩展。
//!
//! ## 模块结构
//!
//! ```text
//! tftp/
//! ├── core/           # 核心协议实现
//! │   ├── packet      # 协议包序列化/反序列化
//! │   ├── socket      # Socket 抽象层
//! │   ├── session     # 停等式传输状态机
//! │   └── lock        # 按文件名的读写锁
//! │
//! ├── server/         # TFTP 服务器
//! │   ├── server      # 监听端口，校验请求
//! │   ├── scheduler   # 每个传输一个线程和端口
//! │   └── config      # 服务器配置
//! │
//! └── client/         # TFTP 客户端
//!     ├── client      # GET / PUT
//!     └── config      # 客户端配置
//! ```
//!
//! ## 使用示例
//!
//! ### 启动 TFTP 服务器
//!
//! ```rust,no_run
//! use tftpkit::tftp::server::{Config, Server};
//! use std::path::PathBuf;
//!
//! let config = Config::default().merge_cli(
//!     "0.0.0.0".to_string(),
//!     69,
//!     PathBuf::from("/var/tftp"),
//!     false, // read_only
//!     None,  // max_sessions
//! );
//!
//! let mut server = Server::new(&config).unwrap();
//! server.listen();
//! ```

// 子模块
pub mod client;
pub mod core;
pub mod server;
