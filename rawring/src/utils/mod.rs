pub(crate) mod sys;

pub(crate) mod thread;
