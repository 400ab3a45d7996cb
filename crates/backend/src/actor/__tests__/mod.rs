mod batch;
mod helpers;
mod pipeline;
