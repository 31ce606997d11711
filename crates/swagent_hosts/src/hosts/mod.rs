mod airos;
mod calix_aeont;
mod calix_eseries;
mod cisco_ios;
mod junos_switch;

pub use airos::AirOs;
pub use calix_aeont::CalixAeOnt;
pub use calix_eseries::CalixESeries;
pub use cisco_ios::CiscoIos;
pub use junos_switch::JunosSwitch;
