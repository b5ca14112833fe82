pub(crate) mod auth;
pub(crate) mod favorites;
pub(crate) mod media;
pub(crate) mod messages;
pub(crate) mod profiles;
