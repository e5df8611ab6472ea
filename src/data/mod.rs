pub mod distance_matrix;
pub mod matrix_reader;
