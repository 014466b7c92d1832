mod async_task;
mod path;

pub(crate) use async_task::*;
pub(crate) use path::*;

#[cfg(test)]
mod async_task_test;
