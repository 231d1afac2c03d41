//! sdpc-test-utils: test infrastructure for sdpc.
//!
//! Provides MockChannel, a scripted in-memory controller transport for
//! exercising the control loop without a network.

mod mock_channel;

pub use mock_channel::MockChannel;
