mod chains;
mod history;
mod sessions;
