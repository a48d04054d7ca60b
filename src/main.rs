fn main() {
    uhf_gate_lib::run()
}
