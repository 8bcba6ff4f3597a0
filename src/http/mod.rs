//! # Módulo HTTP
//!
//! HTTP/1.0 implementado a mano sobre sockets TCP, en ambas direcciones:
//!
//! - Parsing de requests (`request`) para lo que reciben los nodos
//! - Construcción de responses (`response`), también parseables del lado cliente
//! - Status codes (`status`)
//! - Cliente entre nodos (`client`) para dispatch, callbacks y la cola compartida
//!
//! HTTP/1.0 (RFC 1945) no tiene conexiones persistentes ni chunked encoding:
//! cada request abre una conexión y el servidor la cierra al responder, así
//! que el body se delimita con `Content-Length` o con el fin de la conexión.

pub mod client;
pub mod request;
pub mod response;
pub mod status;

pub use client::HttpClient;
pub use request::{Method, Request};
pub use response::Response;
pub use status::StatusCode;
