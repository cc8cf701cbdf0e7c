mod fakes;
mod flow_test;
mod session_test;
mod state_test;
