//! Join operators, sharing the common notion of a left/right pair of
//! input operators whose row types concatenate in the output.

pub mod bnlj;
pub mod hasheqj;
pub mod indexnlj;
pub mod mergeeqj;
