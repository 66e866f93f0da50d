pub use task_group::TaskGroup;

mod task_group;
