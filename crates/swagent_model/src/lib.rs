mod proptree;

pub use proptree::PropTree;
