//! # Mockbus Queue
//!
//! A mock service for unit-testing code that talks to a D-Bus style service.
//!
//! [`DBusQueue`] brings up a private bus, hands the test a client connection
//! for the code under test, and captures every method call that connection
//! makes on objects exported through the queue. The test pops the captured
//! calls in arrival order, checks them and replies, either from the test
//! thread or from a server function running on the queue's server thread.
//!
//! ## Features
//!
//! - **Private bus**: No system or session bus is needed
//! - **FIFO capture**: Calls are popped in the order they arrived
//! - **Server thread**: A server function can answer calls while the test
//!   thread blocks in synchronous client calls
//! - **Assertions**: `#[track_caller]` helpers with readable message dumps
//!
//! ## Example
//!
//! ```rust
//! use mockbus_queue::DBusQueue;
//! use mockbus_transport::{Call, InterfaceInfo, MethodInfo};
//!
//! let mut queue = DBusQueue::new();
//! queue.connect().unwrap();
//!
//! let interface = InterfaceInfo::new("com.example.Greeter")
//!     .method(MethodInfo::new("Hello").in_arg("who", "s").out_arg("greeting", "s"));
//! queue.own_name("com.example.Greeter");
//! queue.export_object("/com/example/Greeter", &interface).unwrap();
//!
//! queue.set_server_func(|queue| {
//!     let mut who = String::new();
//!     let invocation = queue.assert_pop_message(
//!         "/com/example/Greeter",
//!         "com.example.Greeter",
//!         "Hello",
//!         &mut [&mut who],
//!     );
//!     invocation.return_value((format!("Hello, {}!", who),));
//! });
//!
//! let client = queue.client_connection().unwrap();
//! let reply = client
//!     .call_sync(
//!         Call::new("com.example.Greeter", "/com/example/Greeter", "com.example.Greeter", "Hello")
//!             .body(("world",)),
//!     )
//!     .unwrap();
//! assert_eq!(reply.get::<(String,)>().unwrap().0, "Hello, world!");
//!
//! queue.disconnect(true);
//! ```

pub mod assertions;
pub mod bridge;
pub mod config;
pub mod queue;
mod server;

pub use assertions::format_message;
pub use config::QueueConfig;
pub use queue::{DBusQueue, QueueHandle, ServerFunc};
