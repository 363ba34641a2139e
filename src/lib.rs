//! Proxy DLL project generation: MSVC toolchain discovery, dumpbin/undname
//! output parsing, and Visual Studio project emission.

pub mod error;
pub mod exports;
pub mod msvc;
pub mod proxy;
