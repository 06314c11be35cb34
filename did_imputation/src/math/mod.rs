pub mod demean;
pub mod ols;
