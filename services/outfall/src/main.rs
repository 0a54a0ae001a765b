use clap::{App, Arg};
use culvert::net::carrier::{self, CarrierConfig};
use sluice::logging;
use std::net::TcpListener;

pub fn main() {
    let matches = App::new("Culvert Outfall")
        .version("0.1")
        .about("Terminates the carrier and opens outbound connections on behalf of clients.")
        .arg(
            Arg::with_name("server")
                .long("server")
                .help("Carrier bind address")
                .takes_value(true)
                .default_value("127.0.0.1"),
        )
        .arg(
            Arg::with_name("server_port")
                .long("server_port")
                .help("Carrier bind port")
                .takes_value(true)
                .default_value("12322"),
        )
        .get_matches();

    let server = matches.value_of("server").unwrap();
    let server_port: u16 = matches
        .value_of("server_port")
        .unwrap()
        .parse()
        .expect("Invalid --server_port");

    let log = logging::init();
    logging::info!(log, "--- outfall start ---"; "bind" => server, "port" => server_port);

    let listener =
        TcpListener::bind((server, server_port)).expect("Error binding carrier listener");
    carrier::run_egress_listener(listener, CarrierConfig::default(), log);
}
