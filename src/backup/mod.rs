pub mod backup_config;
pub mod coordinator;
pub mod cursor;
pub mod job;
pub mod owner_loop;
pub mod page_count;
pub mod result_error;
pub mod validate;

macro_rules! function_path {
    () => {
        concat!(module_path!(), "::", function_name!(), " ", file!(), ":", line!())
    };
}

pub(crate) use function_path;
