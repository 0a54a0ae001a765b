use clap::{App, Arg};
use culvert::net::carrier::{self, CarrierConfig};
use culvert::net::channel::Channel;
use sluice::logging;
use std::net::{TcpListener, ToSocketAddrs};
use std::sync::Arc;
use std::thread;

pub fn main() {
    let matches = App::new("Culvert Inlet")
        .version("0.1")
        .about("Accepts local SOCKS5 clients and multiplexes their sessions over the carrier.")
        .arg(
            Arg::with_name("port")
                .long("port")
                .help("Local SOCKS5 listener port")
                .takes_value(true)
                .default_value("12321"),
        )
        .arg(
            Arg::with_name("server")
                .long("server")
                .help("Outfall host")
                .takes_value(true)
                .default_value("127.0.0.1"),
        )
        .arg(
            Arg::with_name("server_port")
                .long("server_port")
                .help("Outfall port")
                .takes_value(true)
                .default_value("12322"),
        )
        .get_matches();

    let port: u16 = matches
        .value_of("port")
        .unwrap()
        .parse()
        .expect("Invalid --port");
    let server = matches.value_of("server").unwrap();
    let server_port: u16 = matches
        .value_of("server_port")
        .unwrap()
        .parse()
        .expect("Invalid --server_port");

    let server_addr = (server, server_port)
        .to_socket_addrs()
        .expect("Error resolving --server")
        .next()
        .expect("--server resolved to no address");

    let log = logging::init();
    logging::info!(log, "--- inlet start ---"; "port" => port, "server" => %server_addr);

    let channel = Arc::new(Channel::new(&log));
    let config = CarrierConfig::default();

    {
        let channel = channel.clone();
        let log = log.new(logging::o!("worker" => "carrier"));
        thread::spawn(move || carrier::run_ingress_carrier(channel, server_addr, config, log));
    }

    let listener = TcpListener::bind(("0.0.0.0", port)).expect("Error binding SOCKS5 listener");
    carrier::run_ingress_listener(channel, listener, config, log);
}
