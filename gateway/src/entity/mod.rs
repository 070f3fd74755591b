pub mod dataset_entry;
