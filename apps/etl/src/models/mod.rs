// Row types for every store query and insert surface.
// Stats/report types live with the component that produces them.

pub mod similarity;
pub mod training;
