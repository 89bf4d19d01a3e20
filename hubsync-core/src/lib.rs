mod client;

pub use client::{
    ApiErrorClass, HubClient, HubError, NodeEntry, NodeList, NodeType, TransferLink,
};
