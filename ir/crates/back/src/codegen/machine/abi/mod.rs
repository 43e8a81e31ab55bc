pub use calling_convention::CallingConvention;

pub mod calling_convention;
