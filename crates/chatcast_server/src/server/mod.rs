#![forbid(unsafe_code)]

pub mod backoff;
pub mod broadcast;
pub mod channels;
pub mod dispatch;
pub mod donations;
pub mod health;
pub mod moderation;
pub mod monitor;
pub mod poll;
pub mod registry;
pub mod settings;
pub mod store;
pub mod terms;

#[cfg(test)]
mod test_support;


#[cfg(test)]
mod channels_tests;

#[cfg(test)]
mod dispatch_tests;





#[cfg(test)]
mod registry_tests;
