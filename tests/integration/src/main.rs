mod helpers;

mod state_transfer;
mod transactions;
mod write_skew;
