pub mod akash;
pub mod arweave;
pub mod coin_prices;
mod db;
mod env;
pub mod filecoin;
pub mod helium;
pub mod import_lock;
pub mod importer;
pub mod livepeer;
mod log;
pub mod phala;
pub mod pocket;
pub mod projects;
pub mod revenue;
pub mod units;
pub mod wailinoo;
pub mod watermarks;

pub use akash::import_akash;
pub use arweave::import_arweave;
pub use filecoin::backfill::backfill_filecoin;
pub use filecoin::import_filecoin;
pub use helium::import_helium;
pub use livepeer::import_livepeer;
pub use phala::import_phala;
pub use pocket::import_pocket;
pub use wailinoo::import_wailinoo;
