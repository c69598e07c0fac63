fn main() -> mqtt_rpc::Result<()> {
    mqtt_rpc::cli::main()
}
