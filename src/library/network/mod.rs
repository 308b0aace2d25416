pub mod epoll;
pub mod signal_pipe;
pub mod socket_helpers;
