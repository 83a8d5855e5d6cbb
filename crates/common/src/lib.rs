// bookclub-common: wire types shared by the room relay and its clients

pub mod link;
pub mod protocol;
pub mod types;
